use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// CLI arguments for the signaling hub.
#[derive(Parser, Debug, Clone)]
#[command(name = "hubd")]
#[command(about = "Huddle signaling hub")]
#[command(version)]
pub struct Args {
    /// Host interface to bind.
    #[arg(long, default_value = "127.0.0.1", env = "HUBD_HOST")]
    pub host: IpAddr,
    /// Port to bind.
    #[arg(long, default_value = "8080", env = "HUBD_PORT")]
    pub port: u16,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "HUBD_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Base URL of the auth server that publishes the token public key.
    #[arg(long, default_value = "http://127.0.0.1:8081", env = "HUBD_AUTH_URL")]
    pub auth_url: String,
    /// Maximum members per room.
    #[arg(long, default_value = "4", env = "HUBD_ROOM_CAPACITY")]
    pub room_capacity: usize,
    /// Maximum relayed messages per rate window per connection.
    #[arg(long, default_value = "10", env = "HUBD_MSG_RATE")]
    pub msg_rate: u32,
    /// Rate window length in milliseconds.
    #[arg(long, default_value = "1000", env = "HUBD_RATE_WINDOW_MS")]
    pub rate_window_ms: u64,
    /// Maximum WebSocket frame size in bytes.
    #[arg(long, default_value = "65536", env = "HUBD_MAX_FRAME")]
    pub max_frame_bytes: usize,
    /// Outbound queue depth per member.
    #[arg(long, default_value = "128", env = "HUBD_QUEUE_DEPTH")]
    pub queue_depth: usize,
    /// Idle room expiry in seconds.
    #[arg(long, default_value = "7200", env = "HUBD_ROOM_TTL")]
    pub room_ttl_secs: u64,
    /// Interval between idle sweeps in seconds.
    #[arg(long, default_value = "60", env = "HUBD_SWEEP_INTERVAL")]
    pub sweep_interval_secs: u64,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "HUBD_MAX_CONNS")]
    pub max_conns: usize,
    /// Shutdown drain timeout in seconds.
    #[arg(long, default_value = "5", env = "HUBD_DRAIN_TIMEOUT")]
    pub drain_timeout_secs: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host interface to bind.
    pub host: IpAddr,
    /// Port to bind.
    pub port: u16,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Base URL of the auth server.
    pub auth_url: String,
    /// Maximum members per room.
    pub room_capacity: usize,
    /// Maximum relayed messages per rate window per connection.
    pub msg_rate: u32,
    /// Rate window length in milliseconds.
    pub rate_window_ms: u64,
    /// Maximum WebSocket frame size in bytes.
    pub max_frame_bytes: usize,
    /// Outbound queue depth per member.
    pub queue_depth: usize,
    /// Idle room expiry in seconds.
    pub room_ttl_secs: u64,
    /// Interval between idle sweeps in seconds.
    pub sweep_interval_secs: u64,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Shutdown drain timeout in seconds.
    pub drain_timeout_secs: u64,
}

impl ServerConfig {
    /// Address the relay listens on.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Rate-limit window as a duration.
    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    /// Idle-room TTL as a duration.
    #[must_use]
    pub fn room_ttl(&self) -> Duration {
        Duration::from_secs(self.room_ttl_secs)
    }

    /// Sweep period as a duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Shutdown drain bound as a duration.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Validates the configuration values are within acceptable bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.room_capacity == 0 {
            return Err("room_capacity must be greater than 0".to_string());
        }
        if self.room_capacity > 64 {
            return Err("room_capacity exceeds reasonable limit (64)".to_string());
        }

        if self.msg_rate == 0 {
            return Err("msg_rate must be greater than 0".to_string());
        }
        if self.msg_rate > 10_000 {
            return Err("msg_rate exceeds reasonable limit (10,000 msgs/window)".to_string());
        }

        if self.rate_window_ms < 100 {
            return Err("rate_window_ms must be at least 100".to_string());
        }
        if self.rate_window_ms > 60_000 {
            return Err("rate_window_ms exceeds reasonable limit (60,000 ms)".to_string());
        }

        const MAX_ALLOWED_FRAME: usize = 2 * 1024 * 1024;
        if self.max_frame_bytes < 1024 {
            return Err("max_frame_bytes must be at least 1024".to_string());
        }
        if self.max_frame_bytes > MAX_ALLOWED_FRAME {
            return Err(format!(
                "max_frame_bytes exceeds maximum allowed ({MAX_ALLOWED_FRAME} bytes)"
            ));
        }

        if self.queue_depth < 16 {
            return Err("queue_depth must be at least 16".to_string());
        }
        if self.queue_depth > 4096 {
            return Err("queue_depth exceeds reasonable limit (4096)".to_string());
        }

        if self.room_ttl_secs == 0 {
            return Err("room_ttl_secs must be greater than 0".to_string());
        }
        if self.room_ttl_secs > 604_800 {
            return Err("room_ttl_secs exceeds reasonable limit (604800 seconds / 7 days)".to_string());
        }

        if self.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs must be greater than 0".to_string());
        }
        if self.sweep_interval_secs > 3600 {
            return Err("sweep_interval_secs exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.drain_timeout_secs == 0 {
            return Err("drain_timeout_secs must be greater than 0".to_string());
        }
        if self.drain_timeout_secs > 60 {
            return Err("drain_timeout_secs exceeds reasonable limit (60 seconds)".to_string());
        }

        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            metrics_addr: args.metrics_addr,
            auth_url: args.auth_url,
            room_capacity: args.room_capacity,
            msg_rate: args.msg_rate,
            rate_window_ms: args.rate_window_ms,
            max_frame_bytes: args.max_frame_bytes,
            queue_depth: args.queue_depth,
            room_ttl_secs: args.room_ttl_secs,
            sweep_interval_secs: args.sweep_interval_secs,
            max_conns: args.max_conns,
            drain_timeout_secs: args.drain_timeout_secs,
        }
    }
}
