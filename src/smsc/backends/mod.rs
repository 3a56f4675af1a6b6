//! Concrete SMSC back-ends (§4.4's "back-ends plug in by implementing the
//! `SmscConnection` contract").

pub mod fake;
pub mod smpp;

use std::sync::Arc;

use crate::config::{Backend, SmscConfig};
use crate::error::{GatewayError, Result};
use crate::smsc::{DynSmscConnection, SmscCallbacks, SmscPolicy};

fn policy_from_config(config: &SmscConfig) -> SmscPolicy {
    SmscPolicy {
        allowed_smsc_id: config.allowed_smsc_id.clone(),
        denied_smsc_id: config.denied_smsc_id.clone(),
        preferred_smsc_id: config.preferred_smsc_id.clone(),
        allowed_prefix: config.allowed_prefix.clone(),
        denied_prefix: config.denied_prefix.clone(),
        preferred_prefix: config.preferred_prefix.clone(),
        unified_prefix: config.unified_prefix.as_deref().map(crate::access::UnifiedPrefix::parse).unwrap_or_default(),
        reroute: config.reroute,
        reroute_to_smsc: config.reroute_to_smsc.clone(),
        reroute_by_receiver: config.reroute_by_receiver.clone(),
        reroute_dlr: config.reroute_dlr,
    }
}

/// Constructs the back-end named by `config.backend` (`smscconn_create`'s
/// dispatch-by-type in `gw/smscconn.c`).
pub fn create(config: &SmscConfig, callbacks: Arc<dyn SmscCallbacks>) -> Result<Arc<dyn DynSmscConnection>> {
    let policy = policy_from_config(config);
    match config.backend {
        Backend::Fake => Ok(fake::FakeConnection::spawn(config.id.clone(), policy, callbacks) as Arc<dyn DynSmscConnection>),
        Backend::Smpp => {
            let host = config.host.clone().ok_or_else(|| GatewayError::Config(format!("smsc {}: host is required for smpp backend", config.id)))?;
            let port = config.port.ok_or_else(|| GatewayError::Config(format!("smsc {}: port is required for smpp backend", config.id)))?;
            let system_id = config.system_id.clone().unwrap_or_default();
            let password = config.password.clone().unwrap_or_default();
            let reconnect_delay = std::time::Duration::from_secs(config.reconnect_delay);
            Ok(smpp::SmppConnection::spawn(config.id.clone(), policy, host, port, system_id, password, reconnect_delay, callbacks))
        }
    }
}
