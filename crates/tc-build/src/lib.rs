//! # tc-build
//!
//! Build toolchains suitable for the Linux kernel.
//!
//! ## Usage
//!
//! ```bash
//! tc-build binutils -t aarch64 x86_64   # GNU binutils per target
//! tc-build llvm --pgo kernel-defconfig  # Multi-stage LLVM with PGO
//! tc-build rust                         # Rust against the LLVM above
//! tc-build kernel -t X86                # Build Linux with a toolchain
//! tc-build sources status               # Downloaded sources
//! ```
//!
//! Sources live in `<root>/src`, build trees in `<root>/build/<component>`.

pub mod app;
pub mod binutils;
pub mod builder;
pub mod cli;
pub mod kernel;
pub mod llvm;
pub mod manifest;
pub mod rust;
pub mod source;
pub mod targets;
pub mod tools;
pub mod utils;
pub mod vendor;
