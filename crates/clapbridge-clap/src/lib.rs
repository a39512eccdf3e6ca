//! The bridge plugins and the registry a host enumerates them from.
//!
//! - [`AppLoopback`]: what an application (or the whole system) is playing,
//!   as a plugin output
//! - [`InputCapture`]: an input device as a plugin output
//! - [`DeviceRender`]: the plugin input, played on an output device

pub mod app_loopback;
mod bridge;
pub mod device_render;
pub mod input_capture;
pub mod registry;

pub use app_loopback::AppLoopback;
pub use device_render::DeviceRender;
pub use input_capture::InputCapture;
pub use registry::{PluginEntry, create_plugin, descriptors, find};

/// Vendor string shared by every bridge plugin
pub const VENDOR: &str = "clapbridge";

#[cfg(test)]
pub(crate) mod test_support {
    use clapbridge_plugin::HostHandle;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Host that only counts restart requests
    #[derive(Default)]
    pub struct CountingHost {
        restarts: AtomicUsize,
    }

    impl CountingHost {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn restarts(&self) -> usize {
            self.restarts.load(Ordering::SeqCst)
        }
    }

    impl HostHandle for CountingHost {
        fn request_restart(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
    }
}
