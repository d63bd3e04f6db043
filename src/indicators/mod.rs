// =============================================================================
// Technical Indicators
// =============================================================================
//
// Pure f64 kernels per indicator, fed and cached by the engine. All kernels
// consume chronologically ascending closes and document their warm-up
// alignment against the input.
// =============================================================================

pub mod bollinger;
pub mod engine;
pub mod kdj;
pub mod ma;
pub mod macd;
pub mod rsi;

pub use engine::{IndicatorEngine, IndicatorPoint, MaType};
