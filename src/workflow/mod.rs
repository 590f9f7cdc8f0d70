pub mod cell_ctx;
pub mod cell_flow;

pub use cell_ctx::CellCtx;
pub use cell_flow::{CellFlow, CellOutcome};
