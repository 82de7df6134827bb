pub mod docker;
pub mod driver;
pub mod image;
pub mod labels;
pub mod memory;

pub use docker::DockerDriver;
pub use driver::{ContainerDriver, CreateMachine, DriverError, Machine, Mount, PortMapping};
pub use image::{ImageResolver, KindImageResolver};
pub use labels::{LabelFilter, NodeRole};
pub use memory::MemoryDriver;
