//! Interface implementations.
//!
//! Interfaces are what nodes run. Command interfaces wrap external tools
//! declared in the workflow file; the built-ins route values between them
//! and move data in and out of the working tree.

mod command;
mod datagrabber;
mod datasink;
mod function;
mod identity;
mod merge;
mod registry;
mod select;
mod types;

pub use command::{
    build_command_line, collect_outputs, resolve_inputs, split_extension, CommandInput,
    CommandInterface, CommandOutput, CommandSpec, ARGS_INPUT,
};
pub use datagrabber::DataGrabberInterface;
pub use datasink::{port_folders, DataSinkInterface, SINK_OUTPUT};
pub use function::FunctionInterface;
pub use identity::IdentityInterface;
pub use merge::MergeInterface;
pub use registry::InterfaceRegistry;
pub use select::SelectInterface;
pub use types::{check_inputs, FieldKind, InputField, Interface, InterfaceResult, RunContext};
