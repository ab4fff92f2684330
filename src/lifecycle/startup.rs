//! Startup orchestration.
//!
//! Config is validated first, then event loops, then server groups, then load
//! balancers. Listeners are bound last, by [`App::start`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::validation::validate_config;
use crate::config::{ConfigError, LbConfig};
use crate::error::LbError;
use crate::event_loop::EventLoopGroup;
use crate::lb::{TcpLb, TcpLbHolder};
use crate::lifecycle::AppContext;
use crate::load_balancer::ServerGroup;
use crate::security::{AllowAll, SecurityPolicy};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lb(#[from] LbError),
}

/// Every runtime object built from one configuration.
pub struct App {
    acceptors: Arc<EventLoopGroup>,
    workers: Arc<EventLoopGroup>,
    server_groups: HashMap<String, Arc<ServerGroup>>,
    lbs: Arc<TcpLbHolder>,
}

impl App {
    /// Build with every client allowed.
    pub fn build(config: &LbConfig) -> Result<Self, StartupError> {
        Self::build_with_security(config, Arc::new(AllowAll))
    }

    pub fn build_with_security(config: &LbConfig, security: Arc<dyn SecurityPolicy>) -> Result<Self, StartupError> {
        validate_config(config).map_err(ConfigError::Validation)?;

        let acceptors = EventLoopGroup::with_threads("acceptor", config.event_loops.acceptor_threads)?;
        let workers = EventLoopGroup::with_threads("worker", config.event_loops.worker_threads)?;
        let mut app = App {
            acceptors,
            workers,
            server_groups: HashMap::new(),
            lbs: Arc::new(TcpLbHolder::new()),
        };
        // partially built apps release their loops on error
        if let Err(e) = app.populate(config, security) {
            app.close();
            return Err(e);
        }
        Ok(app)
    }

    fn populate(&mut self, config: &LbConfig, security: Arc<dyn SecurityPolicy>) -> Result<(), StartupError> {
        for sg in &config.server_groups {
            let health_check = sg.health_check.unwrap_or(config.health_check);
            let group = ServerGroup::new(&sg.alias, self.workers.clone(), health_check, sg.method)?;
            self.server_groups.insert(sg.alias.clone(), group.clone());
            for server in &sg.servers {
                group.add(&server.alias, parse_addr(&server.address)?, server.weight)?;
            }
        }

        for lb_config in &config.load_balancers {
            let backend = self
                .server_groups
                .get(&lb_config.backend)
                .cloned()
                .ok_or_else(|| LbError::not_found("server-group", &lb_config.backend))?;
            let lb = TcpLb::new(
                &lb_config.alias,
                self.acceptors.clone(),
                self.workers.clone(),
                parse_addr(&lb_config.bind_address)?,
                backend,
                security.clone(),
            )?;
            lb.set_timeout(Duration::from_millis(lb_config.timeout_ms));
            lb.set_in_buffer_size(lb_config.in_buffer_size);
            lb.set_out_buffer_size(lb_config.out_buffer_size);
            lb.set_persist_timeout(Duration::from_millis(lb_config.persist_timeout_ms));
            self.lbs.add(lb)?;
        }

        tracing::info!(
            acceptors = self.acceptors.len(),
            workers = self.workers.len(),
            server_groups = self.server_groups.len(),
            load_balancers = self.lbs.len(),
            "Application built"
        );
        Ok(())
    }

    /// Bind every load balancer.
    pub fn start(&self) -> Result<(), LbError> {
        for name in self.lbs.names() {
            let lb = self.lbs.get(&name)?;
            lb.start()?;
            tracing::info!(lb = %name, addresses = ?lb.bound_addresses(), backend = %lb.backend().alias(), "Load balancer started");
        }
        Ok(())
    }

    pub fn load_balancers(&self) -> &Arc<TcpLbHolder> {
        &self.lbs
    }

    pub fn server_group(&self, alias: &str) -> Option<&Arc<ServerGroup>> {
        self.server_groups.get(alias)
    }

    pub fn acceptors(&self) -> &Arc<EventLoopGroup> {
        &self.acceptors
    }

    pub fn workers(&self) -> &Arc<EventLoopGroup> {
        &self.workers
    }

    /// Hand teardown of everything this app owns to `ctx`.
    pub fn register_teardown(self, ctx: &AppContext) {
        ctx.on_teardown(move || self.close());
    }

    /// Listeners first, then backends, then loops.
    pub fn close(&self) {
        self.lbs.clear();
        for group in self.server_groups.values() {
            group.destroy();
        }
        self.acceptors.close();
        self.workers.close();
        tracing::info!("Application closed");
    }
}

fn parse_addr(address: &str) -> Result<SocketAddr, LbError> {
    address.parse().map_err(|_| {
        LbError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("`{}` is not a socket address", address),
        ))
    })
}
