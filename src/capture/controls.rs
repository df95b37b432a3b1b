//! Startup camera controls (`VIDIOC_S_CTRL`)

use tracing::{debug, warn};
use v4l::control::{Control, Value};
use v4l::Device;

use crate::ControlsConfig;

pub const BRIGHTNESS: u32 = 0x0098_0900;
pub const CONTRAST: u32 = 0x0098_0901;
pub const SATURATION: u32 = 0x0098_0902;
pub const SHARPNESS: u32 = 0x0098_091b;
pub const EXPOSURE_AUTO: u32 = 0x009a_0901;
pub const EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
pub const FOCUS_ABSOLUTE: u32 = 0x009a_090a;
pub const FOCUS_AUTO: u32 = 0x009a_090c;

/// Sentinel for "let the camera decide" on exposure and focus.
pub const AUTO: i64 = -1;

const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

/// Ordered `(control id, value)` writes for a control set.
///
/// Manual exposure and focus values only stick once the matching auto mode is
/// switched off, so the mode write always precedes the value.
pub fn plan(controls: &ControlsConfig) -> Vec<(u32, i64)> {
    let mut writes = Vec::new();

    for (id, value) in [
        (BRIGHTNESS, controls.brightness),
        (CONTRAST, controls.contrast),
        (SATURATION, controls.saturation),
        (SHARPNESS, controls.sharpness),
    ] {
        if let Some(value) = value {
            writes.push((id, value));
        }
    }

    match controls.exposure {
        Some(AUTO) => writes.push((EXPOSURE_AUTO, EXPOSURE_APERTURE_PRIORITY)),
        Some(value) => {
            writes.push((EXPOSURE_AUTO, EXPOSURE_MANUAL));
            writes.push((EXPOSURE_ABSOLUTE, value));
        }
        None => {}
    }

    match controls.focus {
        Some(AUTO) => writes.push((FOCUS_AUTO, 1)),
        Some(value) => {
            writes.push((FOCUS_AUTO, 0));
            writes.push((FOCUS_ABSOLUTE, value));
        }
        None => {}
    }

    writes
}

/// Apply the control set to an open device. Controls are device specific, so
/// a rejected write is logged and skipped.
///
/// Returns the number of writes the device accepted.
pub fn apply(device: &Device, controls: &ControlsConfig) -> usize {
    let mut applied = 0;
    for (id, value) in plan(controls) {
        let control = Control {
            id,
            value: Value::Integer(value),
        };
        match device.set_control(control) {
            Ok(()) => {
                debug!("Control {:#010x} set to {}", id, value);
                applied += 1;
            }
            Err(e) => warn!("Control {:#010x} = {} rejected: {}", id, value, e),
        }
    }
    applied
}
