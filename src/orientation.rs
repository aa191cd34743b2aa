// Orientation smoother
// Exponential-decay slerp from the displayed attitude toward the latest reported one

use nalgebra::{Quaternion, UnitQuaternion};

use crate::constants::ORIENTATION_TAU_S;

/// Roll/pitch/yaw for the numeric attitude display
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HudAngles {
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
}

/// Smooths attitude updates independently of packet and frame rate.
///
/// The blend factor for a step of `dt` seconds is `1 - exp(-dt / tau)`, so two
/// steps of `dt` land where one step of `2 * dt` would.
#[derive(Debug, Clone)]
pub struct OrientationSmoother {
    tau: f64,
    target: Option<UnitQuaternion<f64>>,
    current: Option<UnitQuaternion<f64>>,
}

impl OrientationSmoother {
    pub fn new(tau: f64) -> Self {
        OrientationSmoother {
            tau,
            target: None,
            current: None,
        }
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    pub fn target(&self) -> Option<&UnitQuaternion<f64>> {
        self.target.as_ref()
    }

    /// The displayed attitude; None until the first valid target.
    pub fn current(&self) -> Option<&UnitQuaternion<f64>> {
        self.current.as_ref()
    }

    /// Accept (w, x, y, z). Missing, non-finite or zero-length input is ignored
    /// and the previous target kept. The first accepted target is shown at once.
    pub fn set_target(&mut self, components: [Option<f64>; 4]) -> bool {
        let [w, x, y, z] = match components {
            [Some(w), Some(x), Some(y), Some(z)] => [w, x, y, z],
            _ => return false,
        };
        if ![w, x, y, z].iter().all(|c| c.is_finite()) {
            return false;
        }
        let raw = Quaternion::new(w, x, y, z);
        let norm = raw.norm();
        if !norm.is_finite() || norm < f64::EPSILON {
            return false;
        }

        let target = UnitQuaternion::from_quaternion(raw);
        if self.current.is_none() {
            self.current = Some(target);
        }
        self.target = Some(target);
        true
    }

    pub fn blend_factor(&self, dt: f64) -> f64 {
        if !dt.is_finite() || dt <= 0.0 {
            return 0.0;
        }
        if self.tau <= 0.0 {
            return 1.0;
        }
        1.0 - (-dt / self.tau).exp()
    }

    /// Move the displayed attitude toward the target by `dt` seconds' worth.
    pub fn advance(&mut self, dt: f64) -> Option<UnitQuaternion<f64>> {
        let target = self.target?;
        let current = self.current?;
        let alpha = self.blend_factor(dt);
        if alpha <= 0.0 {
            return Some(current);
        }

        // q and -q are the same rotation; take the short way round
        let target = if current.coords.dot(&target.coords) < 0.0 {
            UnitQuaternion::new_unchecked(-target.into_inner())
        } else {
            target
        };

        let next = current
            .try_slerp(&target, alpha, 1.0e-9)
            .unwrap_or_else(|| current.nlerp(&target, alpha));
        self.current = Some(next);
        Some(next)
    }

    pub fn hud_angles_deg(&self) -> Option<HudAngles> {
        let (roll, pitch, yaw) = self.current?.euler_angles();
        Some(HudAngles {
            roll_deg: roll.to_degrees(),
            pitch_deg: pitch.to_degrees(),
            yaw_deg: yaw.to_degrees(),
        })
    }
}

impl Default for OrientationSmoother {
    fn default() -> Self {
        Self::new(ORIENTATION_TAU_S)
    }
}
