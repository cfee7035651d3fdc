// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of edgeplane.
//
// edgeplane is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// edgeplane is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with edgeplane.  If not,
// see <http://www.gnu.org/licenses/>.

//! # storage
//!
//! The error type shared by every datastore-facing trait in edgeplane.
//!
//! Each component defines its own object-safe `Backend` trait describing just the datastore
//! operations it needs ([versions](crate::versions::Backend),
//! [node_tasks](crate::node_tasks::Backend), and so on); all of them fail with the [Error] defined
//! here. The interesting part is [Kind]: the components above the datastore need to tell a lost
//! race from a missing table from a momentarily busy database, and they can't be expected to dig
//! through driver-specific error codes to do so. Implementations classify their errors once, on
//! the way out.

use std::fmt::Display;

/// Broad classification of a datastore failure
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    /// A uniqueness constraint rejected the write; another writer got there first
    Conflict,
    /// The statement referenced a table that doesn't exist (any more)
    MissingTable,
    /// Busy, locked, timed-out waiting on a connection, I/O hiccup; worth retrying
    Transient,
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl Error {
    pub fn new(kind: Kind, err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            kind,
            source: Box::new(err),
        }
    }
    pub fn kind(&self) -> Kind {
        self.kind
    }
    pub fn is_conflict(&self) -> bool {
        self.kind == Kind::Conflict
    }
    pub fn is_missing_table(&self) -> bool {
        self.kind == Kind::MissingTable
    }
    pub fn is_transient(&self) -> bool {
        self.kind == Kind::Transient
    }
}

pub type Result<T> = std::result::Result<T, Error>;
