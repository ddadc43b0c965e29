//! Builders for the node configurations. Settings are validated once and then shared
//! immutably for the lifetime of the node.
use lan_io::ThreadPoolSource;
use lan_types::crypto::{StrongKeyLength, WeakKeyLength};
use lan_types::proto::{
    ClientSettings, HostIdGenerationPolicy, ProtocolVersion, ServerSettings,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// The largest message length a node may be configured with
pub const MAX_CONFIGURABLE_MESSAGE_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub settings: Arc<ServerSettings>,
    pub net_pool: ThreadPoolSource,
    pub user_pool: ThreadPoolSource,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub settings: Arc<ClientSettings>,
    pub net_pool: ThreadPoolSource,
    pub user_pool: ThreadPoolSource,
}

#[derive(Default)]
pub struct ServerSettingsBuilder {
    settings: ServerSettings,
    net_pool: Option<ThreadPoolSource>,
    user_pool: Option<ThreadPoolSource>,
}

impl ServerSettingsBuilder {
    /// Starts from already assembled settings, e.g., ones deserialized from a file
    pub fn from_settings(settings: ServerSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn with_listen_addr(&mut self, addr: SocketAddr) -> &mut Self {
        self.settings.listen_addr = addr;
        self
    }

    pub fn with_protocol_version<T: Into<ProtocolVersion>>(&mut self, version: T) -> &mut Self {
        self.settings.protocol_version = version.into();
        self
    }

    /// Where socket I/O runs. Defaults to the runtime current at start
    pub fn with_net_pool(&mut self, pool: ThreadPoolSource) -> &mut Self {
        self.net_pool = Some(pool);
        self
    }

    /// Where user callbacks run. Defaults to the runtime current at start
    pub fn with_user_pool(&mut self, pool: ThreadPoolSource) -> &mut Self {
        self.user_pool = Some(pool);
        self
    }

    pub fn with_user_worker_count(&mut self, count: usize) -> &mut Self {
        self.settings.user_worker_count = count;
        self
    }

    pub fn with_default_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.settings.default_timeout = timeout;
        self
    }

    pub fn with_candidate_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.settings.candidate_timeout = timeout;
        self
    }

    pub fn with_ack_wait_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.settings.ack_wait_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(&mut self, interval: Duration) -> &mut Self {
        self.settings.heartbeat_interval = interval;
        self
    }

    pub fn with_long_tick_interval(&mut self, interval: Duration) -> &mut Self {
        self.settings.long_tick_interval = interval;
        self
    }

    pub fn with_max_message_length(&mut self, len: usize) -> &mut Self {
        self.settings.max_message_length = len;
        self
    }

    pub fn with_nagle(&mut self, enabled: bool) -> &mut Self {
        self.settings.enable_nagle = enabled;
        self
    }

    pub fn with_key_lengths(&mut self, strong: StrongKeyLength, weak: WeakKeyLength) -> &mut Self {
        self.settings.strong_key_length = strong;
        self.settings.weak_key_length = weak;
        self
    }

    pub fn with_server_as_p2p_group_member(&mut self, allowed: bool) -> &mut Self {
        self.settings.allow_server_as_p2p_group_member = allowed;
        self
    }

    pub fn with_empty_p2p_groups(&mut self, allowed: bool) -> &mut Self {
        self.settings.allow_empty_p2p_group = allowed;
        self
    }

    pub fn with_p2p_encryption(&mut self, enabled: bool) -> &mut Self {
        self.settings.enable_p2p_encryption = enabled;
        self
    }

    pub fn with_host_id_policy(
        &mut self,
        policy: HostIdGenerationPolicy,
        recycle_delay: Duration,
    ) -> &mut Self {
        self.settings.host_id_generation_policy = policy;
        self.settings.host_id_recycle_delay = recycle_delay;
        self
    }

    pub fn with_send_queue_warning_capacity(&mut self, bytes: usize) -> &mut Self {
        self.settings.send_queue_warning_capacity = bytes;
        self
    }

    pub fn with_graceful_shutdown_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.settings.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn build(&mut self) -> anyhow::Result<ServerConfig> {
        self.check()?;
        Ok(ServerConfig {
            settings: Arc::new(self.settings.clone()),
            net_pool: self.net_pool.take().unwrap_or_default(),
            user_pool: self.user_pool.take().unwrap_or_default(),
        })
    }

    fn check(&self) -> anyhow::Result<()> {
        let settings = &self.settings;
        check_message_length(settings.max_message_length)?;
        check_intervals(settings.heartbeat_interval, settings.long_tick_interval)?;
        check_pool(self.net_pool.as_ref())?;
        check_pool(self.user_pool.as_ref())?;

        if settings.user_worker_count == 0 {
            return Err(anyhow::Error::msg("At least one user worker is required"));
        }

        for (name, timeout) in [
            ("default timeout", settings.default_timeout),
            ("candidate timeout", settings.candidate_timeout),
            ("ack wait timeout", settings.ack_wait_timeout),
        ] {
            if timeout < settings.heartbeat_interval {
                return Err(anyhow::Error::msg(format!(
                    "The {name} must not be shorter than the heartbeat interval"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Default)]
pub struct ClientSettingsBuilder {
    settings: ClientSettings,
    net_pool: Option<ThreadPoolSource>,
    user_pool: Option<ThreadPoolSource>,
}

impl ClientSettingsBuilder {
    pub fn from_settings(settings: ClientSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn with_server_addr(&mut self, addr: SocketAddr) -> &mut Self {
        self.settings.server_addr = addr;
        self
    }

    pub fn with_protocol_version<T: Into<ProtocolVersion>>(&mut self, version: T) -> &mut Self {
        self.settings.protocol_version = version.into();
        self
    }

    /// Handed to the server's connection-request callback
    pub fn with_user_data<T: Into<Vec<u8>>>(&mut self, user_data: T) -> &mut Self {
        self.settings.user_data = user_data.into();
        self
    }

    pub fn with_net_pool(&mut self, pool: ThreadPoolSource) -> &mut Self {
        self.net_pool = Some(pool);
        self
    }

    pub fn with_user_pool(&mut self, pool: ThreadPoolSource) -> &mut Self {
        self.user_pool = Some(pool);
        self
    }

    pub fn with_user_worker_count(&mut self, count: usize) -> &mut Self {
        self.settings.user_worker_count = count;
        self
    }

    pub fn with_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.settings.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(&mut self, interval: Duration) -> &mut Self {
        self.settings.heartbeat_interval = interval;
        self
    }

    pub fn with_ping_interval(&mut self, interval: Duration) -> &mut Self {
        self.settings.ping_interval = interval;
        self
    }

    pub fn with_nagle(&mut self, enabled: bool) -> &mut Self {
        self.settings.enable_nagle = enabled;
        self
    }

    pub fn with_direct_p2p(&mut self, enabled: bool) -> &mut Self {
        self.settings.enable_direct_p2p = enabled;
        self
    }

    pub fn with_p2p_bind_ip(&mut self, ip: IpAddr) -> &mut Self {
        self.settings.p2p_bind_ip = ip;
        self
    }

    pub fn with_send_queue_warning_capacity(&mut self, bytes: usize) -> &mut Self {
        self.settings.send_queue_warning_capacity = bytes;
        self
    }

    pub fn build(&mut self) -> anyhow::Result<ClientConfig> {
        self.check()?;
        Ok(ClientConfig {
            settings: Arc::new(self.settings.clone()),
            net_pool: self.net_pool.take().unwrap_or_default(),
            user_pool: self.user_pool.take().unwrap_or_default(),
        })
    }

    fn check(&self) -> anyhow::Result<()> {
        let settings = &self.settings;
        check_intervals(settings.heartbeat_interval, settings.long_tick_interval)?;
        check_pool(self.net_pool.as_ref())?;
        check_pool(self.user_pool.as_ref())?;

        if settings.ping_interval.is_zero() {
            return Err(anyhow::Error::msg("The ping interval must be non-zero"));
        }

        if settings.connect_timeout.is_zero() {
            return Err(anyhow::Error::msg("The connect timeout must be non-zero"));
        }

        if settings.user_worker_count == 0 {
            return Err(anyhow::Error::msg("At least one user worker is required"));
        }

        Ok(())
    }
}

fn check_message_length(len: usize) -> anyhow::Result<()> {
    if len == 0 || len > MAX_CONFIGURABLE_MESSAGE_LENGTH {
        return Err(anyhow::Error::msg(format!(
            "The maximum message length must be within 1..={MAX_CONFIGURABLE_MESSAGE_LENGTH}"
        )));
    }
    Ok(())
}

fn check_intervals(heartbeat: Duration, long_tick: Duration) -> anyhow::Result<()> {
    if heartbeat.is_zero() || long_tick.is_zero() {
        return Err(anyhow::Error::msg("Timer intervals must be non-zero"));
    }
    Ok(())
}

fn check_pool(pool: Option<&ThreadPoolSource>) -> anyhow::Result<()> {
    if let Some(ThreadPoolSource::Owned { worker_threads: 0 }) = pool {
        return Err(anyhow::Error::msg("An owned pool needs at least one thread"));
    }
    Ok(())
}
