//! Physical output routing: an opaque external contract the manager calls
//! into after an output-channel allocation decision, never the audio
//! driver's own concern.

use parking_lot::Mutex;

use crate::error::{Result, SamError};

/// `allocate`/`release`/`connect` against named physical ports. Destination
/// names are `<client-name>:<port-base><index>`, 1-origin.
pub trait PortRouter: Send + Sync {
    fn allocate(&self, port_name: &str) -> Result<()>;
    fn release(&self, port_name: &str) -> Result<()>;
    fn connect(&self, src_port: &str, dst_port: &str) -> Result<()>;
}

/// Single in-process implementation: tracks allocated port names and the
/// connections made between them, without touching any real backend.
#[derive(Default)]
pub struct InProcessRouter {
    state: Mutex<RouterState>,
}

#[derive(Default)]
struct RouterState {
    allocated: Vec<String>,
    connections: Vec<(String, String)>,
}

impl InProcessRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocated_ports(&self) -> Vec<String> {
        self.state.lock().allocated.clone()
    }

    pub fn connections(&self) -> Vec<(String, String)> {
        self.state.lock().connections.clone()
    }
}

impl PortRouter for InProcessRouter {
    fn allocate(&self, port_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.allocated.iter().any(|p| p == port_name) {
            return Err(SamError::Transport(format!("port already allocated: {port_name}")));
        }
        state.allocated.push(port_name.to_string());
        Ok(())
    }

    fn release(&self, port_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.allocated.retain(|p| p != port_name);
        state.connections.retain(|(src, dst)| src != port_name && dst != port_name);
        Ok(())
    }

    fn connect(&self, src_port: &str, dst_port: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.allocated.iter().any(|p| p == src_port) {
            return Err(SamError::Transport(format!("unknown source port: {src_port}")));
        }
        state.connections.push((src_port.to_string(), dst_port.to_string()));
        Ok(())
    }
}

/// Build the 1-origin destination port name for one channel of a client.
pub fn port_name(client_name: &str, port_base: &str, index_1origin: u32) -> String {
    format!("{client_name}:{port_base}{index_1origin}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_release_frees_the_name() {
        let router = InProcessRouter::new();
        router.allocate("sam:out1").unwrap();
        assert_eq!(router.allocated_ports(), vec!["sam:out1".to_string()]);
        router.release("sam:out1").unwrap();
        assert!(router.allocated_ports().is_empty());
    }

    #[test]
    fn double_allocate_is_rejected() {
        let router = InProcessRouter::new();
        router.allocate("sam:out1").unwrap();
        assert!(router.allocate("sam:out1").is_err());
    }

    #[test]
    fn connect_requires_allocated_source() {
        let router = InProcessRouter::new();
        assert!(router.connect("sam:out1", "hw:0").is_err());
        router.allocate("sam:out1").unwrap();
        router.connect("sam:out1", "hw:0").unwrap();
        assert_eq!(router.connections().len(), 1);
    }

    #[test]
    fn port_name_is_one_origin() {
        assert_eq!(port_name("client", "out", 1), "client:out1");
    }
}
