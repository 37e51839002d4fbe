//! Port negotiation for the long-lived services.

use std::future::Future;

use serde::Serialize;

use crate::error::{AppError, Result};

/// Number of ports scanned upward from the service default.
pub const PORT_SCAN_RANGE: u16 = 100;

/// Outcome of negotiating a port for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortResolution {
    pub port: u16,
    /// An instance of this service already serves `port`; nothing should be spawned.
    pub reused: bool,
    /// Desired port that was given up because a foreign process holds it.
    pub relocated_from: Option<u16>,
}

/// Check whether `port` can be bound on the loopback interface right now.
pub fn is_port_available(port: u16) -> bool {
    port != 0 && std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    scan_range: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            scan_range: PORT_SCAN_RANGE,
        }
    }
}

impl PortAllocator {
    pub fn with_scan_range(scan_range: u16) -> Self {
        Self {
            scan_range: scan_range.max(1),
        }
    }

    /// Decide which port a service should use.
    ///
    /// A free `desired` port is used as is. An occupied one is reused when
    /// `self_probe` identifies the occupant as this service. Otherwise the
    /// range starting at `scan_start` is searched, never returning `desired`
    /// or `exclude`.
    pub async fn resolve<F, Fut>(
        &self,
        desired: u16,
        scan_start: u16,
        exclude: Option<u16>,
        self_probe: F,
    ) -> Result<PortResolution>
    where
        F: FnOnce(u16) -> Fut,
        Fut: Future<Output = bool>,
    {
        let claimed = exclude == Some(desired);

        if !claimed {
            if is_port_available(desired) {
                return Ok(PortResolution {
                    port: desired,
                    reused: false,
                    relocated_from: None,
                });
            }
            if desired != 0 && self_probe(desired).await {
                log::info!("Port {} is already served by our own instance", desired);
                return Ok(PortResolution {
                    port: desired,
                    reused: true,
                    relocated_from: None,
                });
            }
        }

        match self.scan(scan_start, desired, exclude) {
            Some(port) => {
                log::info!("Port {} unavailable, relocated to {}", desired, port);
                Ok(PortResolution {
                    port,
                    reused: false,
                    relocated_from: Some(desired),
                })
            }
            None => {
                let end = scan_start.saturating_add(self.scan_range - 1);
                log::error!(
                    "No free port for desired {} in range {}-{}",
                    desired,
                    scan_start,
                    end
                );
                Err(AppError::port_unavailable(desired, scan_start, end))
            }
        }
    }

    fn scan(&self, scan_start: u16, desired: u16, exclude: Option<u16>) -> Option<u16> {
        let end = scan_start.saturating_add(self.scan_range - 1);
        (scan_start..=end)
            .filter(|port| *port != desired && Some(*port) != exclude)
            .find(|port| is_port_available(*port))
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::ErrorKind;

    fn occupy() -> (TcpListener, u16) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn free_port_is_used_without_probing() {
        let port = portpicker::pick_unused_port().unwrap();
        let probed = AtomicBool::new(false);

        let resolution = PortAllocator::default()
            .resolve(port, port, None, |_| async {
                probed.store(true, Ordering::SeqCst);
                true
            })
            .await
            .unwrap();

        assert_eq!(
            resolution,
            PortResolution {
                port,
                reused: false,
                relocated_from: None
            }
        );
        assert!(!probed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn own_instance_is_reused() {
        let (_listener, port) = occupy();

        let resolution = PortAllocator::default()
            .resolve(port, port, None, |_| async { true })
            .await
            .unwrap();

        assert_eq!(resolution.port, port);
        assert!(resolution.reused);
        assert_eq!(resolution.relocated_from, None);
    }

    #[tokio::test]
    async fn foreign_occupant_forces_relocation() {
        let (_listener, port) = occupy();

        let resolution = PortAllocator::default()
            .resolve(port, port, None, |_| async { false })
            .await
            .unwrap();

        assert_ne!(resolution.port, port);
        assert!(!resolution.reused);
        assert_eq!(resolution.relocated_from, Some(port));
        assert!(is_port_available(resolution.port));
    }

    #[tokio::test]
    async fn excluded_port_is_never_chosen() {
        let first = portpicker::pick_unused_port().unwrap();
        let probed = AtomicBool::new(false);

        // Desired port already claimed by another service in this startup pass.
        let resolution = PortAllocator::with_scan_range(50)
            .resolve(first, first, Some(first), |_| async {
                probed.store(true, Ordering::SeqCst);
                true
            })
            .await
            .unwrap();

        assert_ne!(resolution.port, first);
        assert!(!resolution.reused);
        assert!(!probed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn exhausted_range_is_an_error() {
        let (_listener, port) = occupy();

        let err = PortAllocator::with_scan_range(1)
            .resolve(port, port, None, |_| async { false })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PortUnavailable);
    }

    #[test]
    fn port_zero_is_never_available() {
        assert!(!is_port_available(0));
    }
}
