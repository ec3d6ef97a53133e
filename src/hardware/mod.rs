//! Rig hardware interfaces.
//!
//! - [`motion`]: ASCII command protocol to the two rotary stage controllers
//! - [`acquisition`]: acquisition engine trait, busy sentinel and capture trigger
//! - [`mock`]: simulated stages and engine for tests and dry runs

pub mod acquisition;
pub mod mock;
pub mod motion;

pub use acquisition::{AcquisitionEngine, AcquisitionTrigger, BusySentinel, ExternalEngine};
pub use motion::{Actuator, AsciiEndpoint, MotionController, MotionEndpoint};
