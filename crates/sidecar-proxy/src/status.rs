//! This sidecar's advertised proxy status.
//!
//! Written at startup (and on shutdown), read by the control plane whenever
//! a peer asks which port the data plane listens on.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Public state of a proxy front-end, as exchanged during peer discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub enabled: bool,
    pub port: u16,
}

/// Thread-safe status holder. Cheap to clone (Arc).
///
/// A single mutex guards both reads and writes so no reader can observe a
/// status assembled from two different writes. Starts out disabled.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    inner: Arc<Mutex<ServerStatus>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: ServerStatus) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = status;
    }

    pub fn status(&self) -> ServerStatus {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_not_ready() {
        let registry = StatusRegistry::new();
        assert_eq!(
            registry.status(),
            ServerStatus {
                enabled: false,
                port: 0
            }
        );
    }

    #[test]
    fn test_set_then_get() {
        let registry = StatusRegistry::new();
        registry.set_status(ServerStatus {
            enabled: true,
            port: 8080,
        });
        assert_eq!(
            registry.status(),
            ServerStatus {
                enabled: true,
                port: 8080
            }
        );
    }

    #[test]
    fn test_clones_share_state() {
        let registry = StatusRegistry::new();
        let reader = registry.clone();
        registry.set_status(ServerStatus {
            enabled: true,
            port: 3600,
        });
        assert!(reader.status().enabled);
        assert_eq!(reader.status().port, 3600);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_values() {
        use std::thread;

        let registry = StatusRegistry::new();
        let a = ServerStatus {
            enabled: true,
            port: 8080,
        };
        let b = ServerStatus {
            enabled: false,
            port: 9090,
        };

        let mut handles = vec![];
        for i in 0..4 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    registry.set_status(if i % 2 == 0 { a } else { b });
                }
            }));
        }
        for _ in 0..4 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let seen = registry.status();
                    let initial = ServerStatus::default();
                    assert!(seen == a || seen == b || seen == initial, "torn status {seen:?}");
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(ServerStatus {
            enabled: true,
            port: 9000,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "enabled": true, "port": 9000 }));
    }
}
