pub mod controller;

pub use controller::{Controller, Role, Status};
