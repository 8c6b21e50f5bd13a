// Copyright (C) 2023 Felix Huettner
//
// This file is part of DTRD.
//
// DTRD is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// DTRD is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Errors that are genuinely visible to a caller of the public API.
//!
//! Everything else (CLA failures, store-full conditions, routing
//! contraindications) is absorbed internally as specified and never reaches
//! here: the BPA's `update()` never returns an error, it only logs and
//! advances.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BpaError {
    #[error("endpoint '{0}' is already registered")]
    EndpointAlreadyRegistered(String),

    #[error("endpoint '{0}' is not registered")]
    EndpointNotRegistered(String),

    #[error("'{0}' is not a valid node URI")]
    InvalidNodeUri(String),

    #[error("'{0}' is not a valid endpoint URI")]
    InvalidEndpointUri(String),

    #[error("'{0}' is not a valid group endpoint URI")]
    InvalidGroupUri(String),

    #[error("endpoint is callback-based and cannot be polled")]
    EndpointIsCallbackBased,
}
