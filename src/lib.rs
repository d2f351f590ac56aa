/*!
A policy language for OpenFlow networks and its compiler to flow tables.

Policies are built from filters, header modifications and the parallel,
sequential and conditional combinators in `policy`. The `compile` module
lowers a policy into a priority ordered `classifier::Classifier` that the
`flowtable` module turns into OpenFlow 1.0 flow entries per switch.
The `runtime` keeps the switches in sync with the live policy and the
discovered `topology` and evaluates punted packets on the controller.

Virtual networks are supported through `virt`, which rewrites a tenant
policy written against a virtual topology into a policy on the physical
network.
Queries in `query` collect the packets a policy sends to the controller.
*/

#[macro_use]
extern crate log;

pub mod apps;
pub mod classifier;
pub mod codec;
pub mod compile;
pub mod conf;
pub mod flowtable;
pub mod header;
pub mod openflow;
pub mod pattern;
pub mod policy;
pub mod query;
pub mod runtime;
pub mod snapshot;
pub mod topology;
pub mod virt;
