use std::sync::Arc;

use crate::config::ServerConfig;
use crate::media::MediaBackends;
use crate::multicast::MulticastCoordinator;
use crate::ports::PortRegistry;
use crate::session::SessionRegistry;

/// Process-wide services shared by every connection and session.
///
/// Each service locks internally; nothing here needs an outer lock.
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub ports: PortRegistry,
    pub sessions: SessionRegistry,
    pub multicast: MulticastCoordinator,
    pub media: MediaBackends,
}

impl ServerContext {
    pub fn new(config: ServerConfig, media: MediaBackends) -> Arc<Self> {
        let ports = config.port_registry();
        let multicast = MulticastCoordinator::new(&config);
        Arc::new(Self {
            config: Arc::new(config),
            ports,
            sessions: SessionRegistry::new(),
            multicast,
            media,
        })
    }
}
