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

//! # edgeplane metrics
//!
//! edgeplane reports metrics through [OpenTelemetry]. OTel would have us build each instrument
//! (counter, gauge) once & re-use it, which raises the question of where to keep them all. Rather
//! than thread a struct with a field per instrument through every component, each module
//! "registers" the metric names it uses with the [inventory] crate:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("versions.increase.contended", Sort::IntegralCounter) }
//! ```
//!
//! A single [Instruments] instance, built at startup & shared behind an `Arc`, pre-builds every
//! registered instrument (panicking on duplicate names), and the [counter_add!] & [gauge_setu!]
//! macros look them up at the collection site:
//!
//! ```ignore
//! counter_add!(self.instruments, "versions.increase.contended", 1, &[]);
//! ```
//!
//! Looking up an unregistered name, or treating a gauge as a counter, panics. Those are logic
//! errors rather than runtime conditions, and [check_metric_registrations] can be called at
//! startup to surface name clashes early.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// A metric name & its instrument type, collected via [inventory]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic if any metric name has been registered twice
pub fn check_metric_registrations() {
    let mut names: HashSet<&'static str> = HashSet::new();
    inventory::iter::<Registration>
        .into_iter()
        .for_each(|reg| {
            if !names.insert(reg.name()) {
                panic!("The metric name {} was registered twice", reg.name());
            }
        });
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    meter: opentelemetry::metrics::Meter,
    map: HashMap<&'static str, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let meter = global::meter(prefix);
        let mut map: HashMap<&'static str, Instrument> = HashMap::new();
        // Building everything up-front means `add` & `record` only need `&self`, so the whole
        // thing can live in an `Arc`.
        inventory::iter::<Registration>
            .into_iter()
            .for_each(|reg| match map.entry(reg.name()) {
                Entry::Occupied(_) => panic!("The metric name {} was used twice", reg.name()),
                Entry::Vacant(vacant) => {
                    vacant.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(reg.name()).build())
                        }
                        Sort::IntegralGauge => {
                            Instrument::GaugeU64(meter.u64_gauge(reg.name()).build())
                        }
                    });
                }
            });
        Instruments { meter, map }
    }
    pub fn meter(&self) -> &opentelemetry::metrics::Meter {
        &self.meter
    }
    /// Panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::CounterU64(c)) => c.add(count, attributes),
            _ => panic!("{} does not name a counter", name),
        }
    }
    /// Panics if `name` doesn't name a gauge
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::GaugeU64(g)) => g.record(value, attributes),
            _ => panic!("{} does not name a gauge", name),
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registrations_are_unique() {
        check_metric_registrations();
        let instruments = Instruments::new("edgeplane");
        counter_add!(instruments, "node_tasks.registered", 1, &[]);
    }
}
