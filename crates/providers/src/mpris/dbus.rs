use super::{BusError, PlayerBus, PlayerReading, TrackMetadata};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Str};
use zbus::{Connection, Proxy};

const DBUS_DEST: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const DBUS_IFACE: &str = "org.freedesktop.DBus";

const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";
const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
const PROPS_IFACE: &str = "org.freedesktop.DBus.Properties";
const PLAYER_IFACE: &str = "org.mpris.MediaPlayer2.Player";

impl From<zbus::Error> for BusError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, detail, _) => {
                let name = name.to_string();
                if name.ends_with("ServiceUnknown") || name.ends_with("NameHasNoOwner") {
                    BusError::PlayerGone(detail.unwrap_or(name))
                } else {
                    BusError::Protocol(format!("{name}: {}", detail.unwrap_or_default()))
                }
            }
            zbus::Error::InputOutput(io) => BusError::Unavailable(io.to_string()),
            other => BusError::Protocol(other.to_string()),
        }
    }
}

impl From<zbus::zvariant::Error> for BusError {
    fn from(err: zbus::zvariant::Error) -> Self {
        BusError::Protocol(err.to_string())
    }
}

/// Session-bus implementation of [`PlayerBus`]. Connects lazily on first use.
#[derive(Default)]
pub struct DbusPlayerBus {
    conn: OnceCell<Connection>,
}

impl DbusPlayerBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connection(&self) -> Result<&Connection, BusError> {
        self.conn
            .get_or_try_init(|| async {
                Connection::session()
                    .await
                    .map_err(|e| BusError::Unavailable(e.to_string()))
            })
            .await
    }

    async fn get_prop(&self, player: &str, prop: &str) -> Result<OwnedValue, BusError> {
        let conn = self.connection().await?;
        let proxy = Proxy::new(conn, player, MPRIS_PATH, PROPS_IFACE).await?;
        let value: OwnedValue = proxy.call("Get", &(PLAYER_IFACE, prop)).await?;
        Ok(value)
    }

    async fn call_player(&self, player: &str, member: &str) -> Result<(), BusError> {
        let conn = self.connection().await?;
        let proxy = Proxy::new(conn, player, MPRIS_PATH, PLAYER_IFACE).await?;
        proxy.call_method(member, &()).await?;
        Ok(())
    }

    fn ov_to_string(v: &OwnedValue) -> Option<String> {
        let owned = v.try_clone().ok()?;
        if let Ok(s) = String::try_from(owned.try_clone().ok()?) {
            return Some(s);
        }
        if let Ok(p) = OwnedObjectPath::try_from(owned.try_clone().ok()?) {
            return Some(p.as_str().to_string());
        }
        if let Ok(s) = Str::try_from(owned) {
            return Some(s.to_string());
        }
        None
    }

    fn ov_to_i64(v: &OwnedValue) -> Option<i64> {
        if let Ok(i) = <i64>::try_from(v) {
            return Some(i);
        }
        if let Ok(u) = <u64>::try_from(v) {
            return i64::try_from(u).ok();
        }
        None
    }

    /// Players send either a string or a string list here; the first entry wins.
    fn first_string(v: &OwnedValue) -> Option<String> {
        if let Ok(arr) = Vec::<String>::try_from(v.try_clone().ok()?) {
            return arr.into_iter().next();
        }
        Self::ov_to_string(v)
    }

    fn metadata_from(map: &HashMap<String, OwnedValue>) -> TrackMetadata {
        TrackMetadata {
            title: map.get("xesam:title").and_then(Self::first_string),
            artist: map.get("xesam:artist").and_then(Self::first_string),
            album: map.get("xesam:album").and_then(Self::first_string),
            art_url: map.get("mpris:artUrl").and_then(Self::first_string),
            track_id: map.get("mpris:trackid").and_then(Self::ov_to_string),
            length_us: map.get("mpris:length").and_then(Self::ov_to_i64),
        }
    }
}

#[async_trait]
impl PlayerBus for DbusPlayerBus {
    async fn list_players(&self) -> Result<Vec<String>, BusError> {
        let conn = self.connection().await?;
        let proxy = Proxy::new(conn, DBUS_DEST, DBUS_PATH, DBUS_IFACE).await?;
        let names: Vec<String> = proxy.call("ListNames", &()).await?;
        Ok(names
            .into_iter()
            .filter(|n| n.starts_with(MPRIS_PREFIX))
            .collect())
    }

    async fn playback_status(&self, player: &str) -> Result<String, BusError> {
        let value = self.get_prop(player, "PlaybackStatus").await?;
        Self::ov_to_string(&value)
            .ok_or_else(|| BusError::Protocol("PlaybackStatus is not a string".to_string()))
    }

    async fn read_player(&self, player: &str) -> Result<PlayerReading, BusError> {
        let status = self.playback_status(player).await?;

        let raw_meta = self.get_prop(player, "Metadata").await?;
        let meta_map = HashMap::<String, OwnedValue>::try_from(raw_meta).unwrap_or_default();
        let metadata = Self::metadata_from(&meta_map);

        let can_seek = bool::try_from(&self.get_prop(player, "CanSeek").await?).unwrap_or(false);
        let position_us = Self::ov_to_i64(&self.get_prop(player, "Position").await?).unwrap_or(0);

        Ok(PlayerReading {
            status,
            metadata,
            position_us,
            can_seek,
        })
    }

    async fn play_pause(&self, player: &str) -> Result<(), BusError> {
        self.call_player(player, "PlayPause").await
    }

    async fn next(&self, player: &str) -> Result<(), BusError> {
        self.call_player(player, "Next").await
    }

    async fn previous(&self, player: &str) -> Result<(), BusError> {
        self.call_player(player, "Previous").await
    }

    async fn set_position(
        &self,
        player: &str,
        track_ref: &str,
        position_ms: u64,
    ) -> Result<(), BusError> {
        let conn = self.connection().await?;
        let proxy = Proxy::new(conn, player, MPRIS_PATH, PLAYER_IFACE).await?;
        let track = ObjectPath::try_from(track_ref)?;
        let position_us = i64::try_from(position_ms.saturating_mul(1_000)).unwrap_or(i64::MAX);
        proxy.call_method("SetPosition", &(track, position_us)).await?;
        Ok(())
    }
}
