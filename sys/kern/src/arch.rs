// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names: interrupt mask control, the CPU identity accessor, context
//! and FPU operations, PIO accessors, the kernel mapping and page translation
//! hooks, and the address-space operations the IPC layer delegates.

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        compile_error!("no bare-metal architecture is wired up in this tree");
    } else {
        // Hosted stand-in used for building and testing the portable kernel
        // logic off-target.
        #[macro_use]
        pub mod hosted;
        pub use hosted::*;
    }
}
