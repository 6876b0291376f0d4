pub mod twap;

pub use twap::{slice_plan, TwapSlicer};
