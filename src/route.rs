//! Mixer route selection.
//!
//! The mixer itself is external; this module only decides which named
//! routes apply for the current device masks.

/// Set on every input device mask.
pub const DEVICE_BIT_IN: u32 = 0x8000_0000;
/// Built-in speaker.
pub const DEVICE_OUT_SPEAKER: u32 = 0x2;
/// Wired headset (with mic).
pub const DEVICE_OUT_WIRED_HEADSET: u32 = 0x4;
/// Wired headphone.
pub const DEVICE_OUT_WIRED_HEADPHONE: u32 = 0x8;
/// Built-in microphone.
pub const DEVICE_IN_BUILTIN_MIC: u32 = DEVICE_BIT_IN | 0x4;
/// Wired headset microphone.
pub const DEVICE_IN_WIRED_HEADSET: u32 = DEVICE_BIT_IN | 0x10;

/// Applies named mixer routes.
pub trait RouteApplier: Send + Sync {
    /// Clears all previously applied routes.
    fn reset(&self) {}

    /// Applies the route called `name`. Must be idempotent.
    fn apply_route(&self, name: &str);
}

/// A router that only logs the routes it is asked to apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRouter;

impl RouteApplier for LogRouter {
    fn apply_route(&self, name: &str) {
        tracing::info!(route = name, "apply route");
    }
}

/// Returns the route names for the given output and input masks.
///
/// `in_devices` may carry [`DEVICE_BIT_IN`]; it is ignored.
pub fn routes_for(out_devices: u32, in_devices: u32) -> Vec<&'static str> {
    let in_devices = in_devices & !DEVICE_BIT_IN;
    let mut routes = Vec::with_capacity(4);

    if out_devices & DEVICE_OUT_SPEAKER != 0 {
        routes.push("speaker");
    }
    if out_devices & (DEVICE_OUT_WIRED_HEADSET | DEVICE_OUT_WIRED_HEADPHONE) != 0 {
        routes.push("headphone");
    }
    if in_devices & (DEVICE_IN_BUILTIN_MIC & !DEVICE_BIT_IN) != 0 {
        routes.push("main-mic");
    }
    if in_devices & (DEVICE_IN_WIRED_HEADSET & !DEVICE_BIT_IN) != 0 {
        routes.push("headset-mic");
    }
    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes() {
        assert_eq!(
            routes_for(DEVICE_OUT_SPEAKER, DEVICE_IN_BUILTIN_MIC),
            vec!["speaker", "main-mic"]
        );
    }

    #[test]
    fn test_headset_routes() {
        assert_eq!(
            routes_for(DEVICE_OUT_WIRED_HEADSET, DEVICE_IN_WIRED_HEADSET & !DEVICE_BIT_IN),
            vec!["headphone", "headset-mic"]
        );
    }

    #[test]
    fn test_combined_output() {
        assert_eq!(
            routes_for(DEVICE_OUT_SPEAKER | DEVICE_OUT_WIRED_HEADPHONE, 0),
            vec!["speaker", "headphone"]
        );
    }

    #[test]
    fn test_no_routes() {
        assert!(routes_for(0, DEVICE_BIT_IN).is_empty());
    }
}
