//! # Base Protocol Manager
//!
//! Code → handler registry shared by the cs and mine protocol managers.
//! Handlers are registered once while the manager is wired and are looked up
//! per message on the read loop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::domain::{code_name, CommError, Msg, Peer, PROTOCOL_MAX_MSG_SIZE};
use crate::ports::{CommunicationExecutable, CommunicationService};

#[derive(Default)]
pub struct BaseProtocolManager {
    handlers: RwLock<HashMap<u64, Arc<dyn CommunicationService>>>,
    executables: RwLock<Vec<Arc<dyn CommunicationExecutable>>>,
}

impl BaseProtocolManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every code of `service` to it. A code registered twice fails
    /// the whole registration and leaves the table untouched.
    pub fn register_communication_service(
        &self,
        service: Arc<dyn CommunicationService>,
        executable: Option<Arc<dyn CommunicationExecutable>>,
    ) -> Result<(), CommError> {
        let codes = service.msg_codes();
        let mut handlers = self.handlers.write();
        if let Some(code) = codes.iter().find(|c| handlers.contains_key(c)) {
            return Err(CommError::DuplicateHandler(*code));
        }
        for code in codes {
            debug!(code = %code_name(code), "registered message handler");
            handlers.insert(code, service.clone());
        }
        drop(handlers);

        if let Some(executable) = executable {
            self.executables.write().push(executable);
        }
        Ok(())
    }

    /// Service with a lifecycle but no message codes.
    pub fn register_executable(&self, executable: Arc<dyn CommunicationExecutable>) {
        self.executables.write().push(executable);
    }

    pub fn has_handler(&self, code: u64) -> bool {
        self.handlers.read().contains_key(&code)
    }

    pub fn start_services(&self) -> Result<(), CommError> {
        let executables = self.executables.read().clone();
        for executable in &executables {
            executable.start()?;
        }
        info!(services = executables.len(), "communication services started");
        Ok(())
    }

    pub fn stop_services(&self) {
        let executables = self.executables.read().clone();
        for executable in executables.iter().rev() {
            executable.stop();
        }
    }

    /// Hand `msg` to its registered handler.
    pub async fn dispatch(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        let handler = self
            .handlers
            .read()
            .get(&msg.code)
            .cloned()
            .ok_or(CommError::HandlerNotFound(msg.code))?;
        handler.handle_msg(msg, peer).await
    }
}

/// Refuse messages over the protocol size cap.
pub fn check_msg_size(msg: &Msg) -> Result<(), CommError> {
    if msg.size > PROTOCOL_MAX_MSG_SIZE {
        return Err(CommError::MessageTooLarge {
            size: msg.size,
            max: PROTOCOL_MAX_MSG_SIZE,
        });
    }
    Ok(())
}
