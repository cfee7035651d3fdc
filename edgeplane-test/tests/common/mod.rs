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

use edgeplane_test::Fixture;
use futures::future::BoxFuture;
use libtest_mimic::Failed;

/// An integration test; each gets a [Fixture] of its own
#[derive(Debug)]
pub struct Test {
    pub name: &'static str,
    pub test_fn: fn(fixture: Fixture) -> BoxFuture<'static, Result<(), Failed>>,
}

inventory::collect!(Test);
