//! IXXAT USB device implementation
//!
//! [`IxxatUsb`] is one attached board: it wakes the board, reads its
//! capabilities and identification, and creates one [`Channel`] per CAN
//! controller.

use std::sync::Arc;
use std::thread;

use log::{info, warn};
use rusb::{DeviceHandle, GlobalContext};

use crate::adapter::{self, Adapter};
use crate::channel::Channel;
use crate::constants::*;
use crate::error::{IxxatError, Result};
use crate::sink::NetSink;
use crate::structures::{DeviceCaps, DeviceInfo};
use crate::transport::{BulkTransport, CommandTransport, TransportConfig};
use crate::usb::RusbTransport;

/// IXXAT USB board handle
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use ixxat_usb::{CanFrame, EventQueue, IxxatUsb};
///
/// let devices = IxxatUsb::scan()?;
/// let Some(device) = devices.into_iter().next() else {
///     println!("No IXXAT USB device found");
///     return Ok(());
/// };
///
/// let (sink, events) = EventQueue::new();
/// let sink = Arc::new(sink);
/// let (dev, usb) = IxxatUsb::open(&device, |_| sink.clone())?;
///
/// let ch = dev.channel(0)?;
/// ch.set_bitrate(500_000)?;
/// ch.open()?;
/// ch.transmit(&CanFrame::new(0x123, false, &[0x01, 0x02])?)?;
///
/// usb.pump(ch, std::time::Duration::from_millis(100))?;
/// while let Ok(event) = events.try_recv() {
///     println!("{:?}", event);
/// }
/// ch.close()?;
/// # Ok::<(), ixxat_usb::IxxatError>(())
/// ```
pub struct IxxatUsb {
    adapter: &'static Adapter,
    vendor_id: u16,
    product_id: u16,
    caps: DeviceCaps,
    info: DeviceInfo,
    channels: Vec<Arc<Channel>>,
    detached: bool,
}

impl IxxatUsb {
    /// Bring up a board on an already claimed interface
    ///
    /// `endpoints` lists the endpoint addresses present on the interface;
    /// every channel's endpoint pair must be among them. `sink_for` supplies
    /// the network sink of each channel by controller index.
    pub fn attach<F>(
        vendor_id: u16,
        product_id: u16,
        commands: CommandTransport,
        bulk: Arc<dyn BulkTransport>,
        endpoints: &[u8],
        mut sink_for: F,
    ) -> Result<Self>
    where
        F: FnMut(u8) -> Arc<dyn NetSink>,
    {
        let adapter = adapter::lookup(vendor_id, product_id).ok_or(IxxatError::UnknownProduct {
            vendor_id,
            product_id,
        })?;

        commands.power(IXXAT_USB_POWER_WAKEUP)?;
        thread::sleep(commands.config().wakeup_delay);

        let caps = commands.device_caps()?;
        let info = commands.device_info()?;
        info!(
            "{} ({}) attached, {} bus controllers",
            info.name,
            info.id,
            caps.bus_ctrl_types.len()
        );

        let commands = Arc::new(commands);
        let mut channels = Vec::new();
        for index in caps.can_controllers() {
            let Some(eps) = adapter.endpoints(index) else {
                warn!("Controller {} beyond channel limit, ignored", index);
                continue;
            };
            for ep in [eps.msg_in, eps.msg_out] {
                if !endpoints.contains(&ep) {
                    return Err(IxxatError::MissingEndpoint(ep));
                }
            }
            let index = index as u8;
            channels.push(Arc::new(Channel::new(
                adapter,
                index,
                eps,
                Arc::clone(&commands),
                Arc::clone(&bulk),
                sink_for(index),
            )));
        }

        if channels.is_empty() {
            warn!("{} reports no CAN controller", info.name);
        }

        Ok(Self {
            adapter,
            vendor_id,
            product_id,
            caps,
            info,
            channels,
            detached: false,
        })
    }

    /// Check if a USB id belongs to a supported board
    pub fn is_supported(vendor_id: u16, product_id: u16) -> bool {
        adapter::lookup(vendor_id, product_id).is_some()
    }

    /// Scan for supported boards
    pub fn scan() -> Result<Vec<rusb::Device<GlobalContext>>> {
        let mut devices = Vec::new();

        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };

            if Self::is_supported(desc.vendor_id(), desc.product_id()) {
                devices.push(device);
            }
        }

        Ok(devices)
    }

    /// Open and attach a board found by [`IxxatUsb::scan`]
    ///
    /// Returns the board and the transport that moves its bulk traffic.
    pub fn open<F>(
        device: &rusb::Device<GlobalContext>,
        sink_for: F,
    ) -> Result<(Self, Arc<RusbTransport>)>
    where
        F: FnMut(u8) -> Arc<dyn NetSink>,
    {
        let desc = device.device_descriptor()?;
        let mut handle = device.open()?;

        // Detach kernel driver on Linux/Unix
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(0).unwrap_or(false) {
                handle.detach_kernel_driver(0)?;
            }
        }
        handle.claim_interface(0)?;

        let endpoints = interface_endpoints(device)?;
        let handle: Arc<DeviceHandle<GlobalContext>> = Arc::new(handle);
        let usb = Arc::new(RusbTransport::new(Arc::clone(&handle)));

        let commands = CommandTransport::with_config(Box::new(handle), TransportConfig::default());
        let bulk: Arc<dyn BulkTransport> = usb.clone();
        let dev = Self::attach(
            desc.vendor_id(),
            desc.product_id(),
            commands,
            bulk,
            &endpoints,
            sink_for,
        )?;
        Ok((dev, usb))
    }

    /// Channel by controller index
    pub fn channel(&self, index: u8) -> Result<&Arc<Channel>> {
        self.channels
            .iter()
            .find(|ch| ch.index() == index)
            .ok_or(IxxatError::InvalidChannel {
                channel: index,
                max_channels: self.channels.len() as u8,
            })
    }

    /// All channels
    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    /// Adapter descriptor
    pub fn adapter(&self) -> &'static Adapter {
        self.adapter
    }

    /// Board identification
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Board capabilities
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Tear down every channel after the board was unplugged
    pub fn detach(&mut self) {
        for ch in &self.channels {
            ch.detach();
        }
        self.detached = true;
        info!("{} detached", self.info.name);
    }
}

fn interface_endpoints(device: &rusb::Device<GlobalContext>) -> Result<Vec<u8>> {
    let config = device.active_config_descriptor()?;
    let endpoints = config
        .interfaces()
        .filter(|iface| iface.number() == 0)
        .flat_map(|iface| iface.descriptors())
        .flat_map(|desc| {
            desc.endpoint_descriptors()
                .map(|ep| ep.address())
                .collect::<Vec<_>>()
        })
        .collect();
    Ok(endpoints)
}

impl std::fmt::Display for IxxatUsb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:04x}:{:04x} ({}, {} channels)",
            self.adapter.name,
            self.vendor_id,
            self.product_id,
            self.info.id,
            self.channels.len()
        )
    }
}

impl std::fmt::Debug for IxxatUsb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IxxatUsb")
            .field("adapter", &self.adapter.name)
            .field("vendor_id", &format_args!("0x{:04x}", self.vendor_id))
            .field("product_id", &format_args!("0x{:04x}", self.product_id))
            .field("channels", &self.channels.len())
            .field("detached", &self.detached)
            .finish()
    }
}

impl Drop for IxxatUsb {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        // Stop channels that are still open
        for ch in &self.channels {
            while ch.open_count() > 0 {
                if ch.close().is_err() {
                    ch.detach();
                    break;
                }
            }
        }
    }
}
