// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

pub mod cleanup;
pub mod hashing;
pub mod logging;
pub mod process;
pub mod settings;
