pub mod batch_coordinator;

pub use batch_coordinator::BatchCoordinator;
