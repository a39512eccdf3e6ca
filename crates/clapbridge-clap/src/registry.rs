//! Static table of the plugins this crate provides.

use crate::{app_loopback, device_render, input_capture};
use clapbridge_device::DeviceBackend;
use clapbridge_plugin::{HostHandle, Plugin, PluginDescriptor, PluginError};
use std::sync::Arc;

/// Constructor of one plugin
pub type CreateFn = fn(Arc<dyn HostHandle>, Arc<dyn DeviceBackend>) -> Box<dyn Plugin>;

/// One row of the registry
pub struct PluginEntry {
    pub descriptor: &'static PluginDescriptor,
    pub create: CreateFn,
}

static ENTRIES: [PluginEntry; 3] = [
    PluginEntry {
        descriptor: &app_loopback::DESCRIPTOR,
        create: app_loopback::create,
    },
    PluginEntry {
        descriptor: &device_render::DESCRIPTOR,
        create: device_render::create,
    },
    PluginEntry {
        descriptor: &input_capture::DESCRIPTOR,
        create: input_capture::create,
    },
];

/// Every registered plugin, in a stable order
#[must_use]
pub fn entries() -> &'static [PluginEntry] {
    &ENTRIES
}

pub fn descriptors() -> impl Iterator<Item = &'static PluginDescriptor> {
    ENTRIES.iter().map(|entry| entry.descriptor)
}

#[must_use]
pub fn find(id: &str) -> Option<&'static PluginEntry> {
    ENTRIES.iter().find(|entry| entry.descriptor.id == id)
}

/// Instantiate the plugin registered under `id`.
pub fn create_plugin(
    id: &str,
    host: Arc<dyn HostHandle>,
    backend: Arc<dyn DeviceBackend>,
) -> Result<Box<dyn Plugin>, PluginError> {
    let entry = find(id).ok_or_else(|| PluginError::UnknownPlugin(id.to_string()))?;
    Ok((entry.create)(host, backend))
}
