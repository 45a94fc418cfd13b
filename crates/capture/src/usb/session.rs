//! Device session
//!
//! Opens the first matching capture device, detaches the kernel audio driver
//! from the streaming interface, claims it and selects the audio alternate
//! setting. Dropping the session undoes all of it.

use crate::config::{DeviceCandidate, DeviceSettings};
use crate::error::{CaptureError, Result};
use rusb::{Context, DeviceHandle, UsbContext};
use tracing::{debug, info, warn};

/// Opened device with the streaming interface claimed
pub struct DeviceSession {
    context: Context,
    handle: DeviceHandle<Context>,
    candidate: DeviceCandidate,
    interface: u8,
    alt_setting: u8,
    claimed: bool,
    detached_kernel_driver: bool,
}

impl DeviceSession {
    /// Open the first candidate that is present and prepare it for streaming
    pub fn open(context: &Context, settings: &DeviceSettings) -> Result<Self> {
        let candidates = settings.candidates();
        let (candidate, handle) = candidates
            .iter()
            .find_map(|candidate| {
                debug!("Looking for {}", candidate);
                context
                    .open_device_with_vid_pid(candidate.vendor_id, candidate.product_id)
                    .map(|handle| (candidate.clone(), handle))
            })
            .ok_or_else(|| CaptureError::DeviceNotFound {
                candidates: candidates
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;

        info!("Found {}", candidate);

        let mut session = Self {
            context: context.clone(),
            handle,
            candidate,
            interface: settings.interface,
            alt_setting: settings.alt_setting,
            claimed: false,
            detached_kernel_driver: false,
        };
        // Anything acquired so far is released by Drop if a step fails
        session.prepare(settings.detach_kernel_driver)?;
        Ok(session)
    }

    fn prepare(&mut self, detach_kernel_driver: bool) -> Result<()> {
        let interface = self.interface;

        if detach_kernel_driver {
            match self.handle.kernel_driver_active(interface) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", interface);
                    self.handle
                        .detach_kernel_driver(interface)
                        .map_err(|source| CaptureError::KernelDriver { interface, source })?;
                    self.detached_kernel_driver = true;
                }
                Ok(false) => {
                    debug!("No kernel driver active on interface {}", interface);
                }
                Err(e) => {
                    debug!(
                        "Could not check kernel driver status for interface {}: {}",
                        interface, e
                    );
                }
            }
        }

        self.handle
            .claim_interface(interface)
            .map_err(|source| CaptureError::ClaimInterface { interface, source })?;
        self.claimed = true;
        debug!("Claimed interface {}", interface);

        let alt_setting = self.alt_setting;
        self.handle
            .set_alternate_setting(interface, alt_setting)
            .map_err(|source| CaptureError::AltSetting {
                interface,
                alt_setting,
                source,
            })?;
        debug!(
            "Selected alternate setting {} on interface {}",
            alt_setting, interface
        );

        Ok(())
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    pub fn candidate(&self) -> &DeviceCandidate {
        &self.candidate
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.claimed {
            if let Err(e) = self.handle.release_interface(self.interface) {
                warn!("Failed to release interface {}: {}", self.interface, e);
            } else {
                debug!("Released interface {}", self.interface);
            }
        }

        if self.detached_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    self.interface, e
                );
            } else {
                debug!("Reattached kernel driver to interface {}", self.interface);
            }
        }

        debug!("Closed {}", self.candidate);
    }
}

/// A connected device that matches one of the candidates
#[derive(Debug, Clone)]
pub struct DeviceListing {
    pub candidate: DeviceCandidate,
    pub bus_number: u8,
    pub address: u8,
    pub product: Option<String>,
}

/// List connected devices matching the configured candidates, in priority
/// order
pub fn list_candidates(context: &Context, settings: &DeviceSettings) -> Result<Vec<DeviceListing>> {
    let devices = context.devices().map_err(CaptureError::Context)?;
    let candidates = settings.candidates();
    let mut found = Vec::new();

    for candidate in &candidates {
        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!("Skipping device without descriptor: {}", e);
                    continue;
                }
            };
            if descriptor.vendor_id() != candidate.vendor_id
                || descriptor.product_id() != candidate.product_id
            {
                continue;
            }

            let product = device.open().ok().and_then(|handle| {
                descriptor
                    .product_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            });

            found.push(DeviceListing {
                candidate: candidate.clone(),
                bus_number: device.bus_number(),
                address: device.address(),
                product,
            });
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_without_device() {
        // USB access may be unavailable in CI; only check the failure shape
        let context = match Context::new() {
            Ok(context) => context,
            Err(e) => {
                eprintln!("USB context creation failed (expected without USB): {}", e);
                return;
            }
        };

        let settings = DeviceSettings {
            device_filters: vec!["0xffff:0xfffe".to_string()],
            ..DeviceSettings::default()
        };
        match DeviceSession::open(&context, &settings) {
            Err(CaptureError::DeviceNotFound { candidates }) => {
                assert_eq!(candidates, "ffff:fffe");
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("no device should match ffff:fffe"),
        }
    }
}
