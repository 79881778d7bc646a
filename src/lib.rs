//! Core of Cubic, the Custom Ubuntu ISO Creator.
//!
//! Cubic remasters a live Linux ISO: it mounts the source image, copies its
//! disk tree and unpacks its compressed root filesystem into a project
//! directory, lets the user work inside that root as a chroot shell, and
//! then packs everything back into a new bootable ISO with updated boot
//! menus, manifests, compression and checksums.
//!
//! This crate is everything below the user interface:
//!
//! - **Layout discovery** - which directory and file names a given ISO uses
//! - **Process running** - pseudo-TTY children, cancellation, elevated helper calls
//! - **Progress tracking** - smoothing sparse tool percentages into steady progress
//! - **Boot configuration** - rewriting kernel, initrd and `boot=` references
//! - **ISO session** - opening a source ISO into a project and tearing it down
//! - **Virtual environment** - the chroot shell
//! - **ISO assembly** - squashfs, manifests, checksums and `xorriso`
//! - **Emulator** - booting the result in QEMU
//!
//! # Architecture
//!
//! ```text
//! source.iso ──► session (mount, rsync, unsquashfs, partitions)
//!                   │
//!                   ├── layout   identifies casper/squashfs names
//!                   ├── kernel   lists kernels in custom-root
//!                   ▼
//!            virtual_env (chroot shell) + boot_config (menus)
//!                   │
//!                   ▼
//!            artifact (mksquashfs, md5sum.txt, xorriso) ──► custom.iso
//!                   │
//!                   ▼
//!            emulator (qemu-system-x86_64)
//! ```
//!
//! Every external tool goes through [`process::Cmd`]; anything needing root
//! goes through `pkexec cubic-helper <verb>` (see [`process::privileged`]).

pub mod artifact;
pub mod boot_config;
pub mod emulator;
pub mod error;
pub mod helper;
pub mod kernel;
pub mod layout;
pub mod logging;
pub mod mountinfo;
pub mod preflight;
pub mod process;
pub mod progress;
pub mod project;
pub mod session;
pub mod virtual_env;

pub use artifact::{AssemblyStep, IsoAssembler};
pub use error::{ProcessError, ValidationError};
pub use layout::LayoutProfile;
pub use process::{Cmd, ProcessRunner};
pub use project::{Project, ProjectConfig};
pub use session::IsoSession;
pub use virtual_env::VirtualEnvironment;
