use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard membership limit per room.
pub const ROOM_CAPACITY: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Audio-processing hints passed to the capture backend where supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioOptions {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub ice_candidate_pool_size: u8,
    /// Bounded retry for create-room conflicts and transient store failures.
    pub create_retry_attempts: u32,
    #[serde(with = "millis")]
    pub create_retry_delay: Duration,
    /// Pause between evicting all participants and deleting the room record.
    #[serde(with = "millis")]
    pub delete_settle_delay: Duration,
    pub audio: AudioOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServerConfig {
                    urls: vec!["stun:stun.l.google.com:19302".to_string()],
                    username: None,
                    credential: None,
                },
                IceServerConfig {
                    urls: vec!["stun:stun1.l.google.com:19302".to_string()],
                    username: None,
                    credential: None,
                },
            ],
            ice_candidate_pool_size: 10,
            create_retry_attempts: 3,
            create_retry_delay: Duration::from_millis(200),
            delete_settle_delay: Duration::from_millis(500),
            audio: AudioOptions::default(),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
