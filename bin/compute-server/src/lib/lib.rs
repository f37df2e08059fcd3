// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod backends;
pub mod collaborators;
pub mod host_info;
pub mod manager;
pub mod migrate;
pub mod server;
pub mod sim;
