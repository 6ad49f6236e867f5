// Copyright (c) 2016-2017 Chef Software Inc. and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("can't launch process: {0}")]
    ExecFailed(String),

    #[error("activation socket path occupied by a non-socket")]
    ActivationSocketOccupied,

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("pid file is corrupt: {}", .0.display())]
    PidFileCorrupt(PathBuf),

    #[error("service restarting too quickly")]
    RestartDenied,
}

pub type Result<T> = std::result::Result<T, Error>;
