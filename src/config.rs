//! Session configuration.
//!
//! Values are layered, later sources overriding earlier ones:
//! 1. built-in defaults
//! 2. a TOML file, if it exists
//! 3. environment variables prefixed with `CAMERA_SESSION_`
//!
//! ```no_run
//! use camera_session::SessionConfig;
//!
//! let config = SessionConfig::load_from("camera-session.toml")?;
//! println!("{} frame buffers", config.buffer_count);
//! # Ok::<(), figment::Error>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "CAMERA_SESSION_";

/// Tunables for one camera session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of frame buffers in the pool.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// Length of each frame buffer. Defaults to the device's largest frame.
    #[serde(default)]
    pub frame_len: Option<usize>,
    /// Capacity of the callback queue. Defaults to `buffer_count`.
    #[serde(default)]
    pub callback_queue_depth: Option<usize>,
    /// Upper bound on the wait between synthesized frames, in milliseconds.
    #[serde(default = "default_max_frame_wait_ms")]
    pub max_frame_wait_ms: u64,
    /// Prefix for the names of the session's threads.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

const fn default_buffer_count() -> usize {
    8
}

const fn default_max_frame_wait_ms() -> u64 {
    100
}

fn default_thread_name_prefix() -> String {
    "camera-session".to_owned()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_count: default_buffer_count(),
            frame_len: None,
            callback_queue_depth: None,
            max_frame_wait_ms: default_max_frame_wait_ms(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from `path` and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> std::result::Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The layered provider used by [`SessionConfig::load_from`].
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Set the number of frame buffers.
    #[must_use]
    pub const fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Set the frame buffer length.
    #[must_use]
    pub const fn with_frame_len(mut self, frame_len: usize) -> Self {
        self.frame_len = Some(frame_len);
        self
    }

    /// Set the synthesized frame wait cap.
    #[must_use]
    pub const fn with_max_frame_wait(mut self, wait: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.max_frame_wait_ms = wait.as_millis() as u64;
        }
        self
    }

    /// Capacity of the callback queue.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.callback_queue_depth.unwrap_or(self.buffer_count)
    }

    /// Upper bound on the wait between synthesized frames.
    #[must_use]
    pub const fn max_frame_wait(&self) -> Duration {
        Duration::from_millis(self.max_frame_wait_ms)
    }

    /// Reject settings a session cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 {
            return Err(SessionError::MemAlloc("buffer_count must be at least 1".to_owned()));
        }
        if self.frame_len == Some(0) {
            return Err(SessionError::MemAlloc("frame_len must be non-zero".to_owned()));
        }
        if self.queue_depth() == 0 {
            return Err(SessionError::MemAlloc(
                "callback_queue_depth must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
