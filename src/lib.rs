//! neuropipe - neuroimaging workflow engine
//!
//! Workflows are YAML files that wire command-line tools (interfaces) into a
//! graph. Nested workflows are flattened, iterable nodes expand into
//! parameter sweeps, and every node instance runs in its own working
//! directory where its result is cached against a hash of its inputs.
//!
//! ## Example
//!
//! ```yaml
//! name: preproc
//!
//! interfaces:
//!   smooth:
//!     command: fslmaths
//!     inputs:
//!       in_file: { type: file, argstr: "%s", position: 0, mandatory: true }
//!       fwhm: { type: float, argstr: "-s %s", position: 1 }
//!       out_file: { type: string, argstr: "%s", position: 2, default: smoothed.nii.gz }
//!     outputs:
//!       out_file: { from_input: out_file }
//!
//! nodes:
//!   - name: iter_fwhm
//!     interface: identity
//!     config: { fields: [fwhm] }
//!     iterables:
//!       fwhm: [4, 8]
//!   - name: smooth
//!     interface: smooth
//!     inputs:
//!       in_file: func.nii.gz
//!
//! connections:
//!   - from: iter_fwhm.fwhm
//!     to: smooth.fwhm
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod interfaces;
pub mod metrics;
pub mod script;
pub mod shutdown;
pub mod storage;
pub mod workflow;

pub use error::{Error, Result};
