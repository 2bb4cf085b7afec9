mod backend;
pub mod backends;
mod normalize;
mod result;

pub use backend::{HazardModel, RawBox, Thresholds};
pub use backends::ScriptedModel;
#[cfg(feature = "backend-tract")]
pub use backends::TractYolo;
pub use normalize::{normalize, ClassTable};
pub use result::{BBox, Detection};
