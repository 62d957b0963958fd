pub mod replication;
pub mod results;
pub mod simulation;
pub mod supervisor;
