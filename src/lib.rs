pub mod client;
pub mod clock;
pub mod config;
pub mod expiry;
pub mod pipeline;
pub mod protocol;
pub mod register;
pub mod retry;
pub mod server;
pub mod snapshot;
pub mod sync;

// develop notes that does not apply to any specific code
//
// there is exactly one place that mutates the aggregate: the pipeline worker.
// connection tasks are producers into its queue and consumers of its published
// state, plus the two shared atomics (the lamport clock and the watermark). if
// something new needs to touch records, it goes through `pipeline::Enqueue`,
// not a lock around the aggregate
//
// logical time on the server side is the merged server clock, not the value a
// writer presents. a writer that presents nothing still gets ordered after
// everything the server has seen, and two writers presenting the same value
// still get distinct times. the source id tie-break in `register` therefore
// only matters for records that were written by different processes and later
// brought together (e.g. restored from a snapshot)
//
// reads wait for `min(reader time, highest enqueued time)` rather than the
// reader time alone. the watermark can only reach lamports that have been
// enqueued, so waiting for the raw reader time would make every read without a
// concurrent write run into the timeout
//
// staleness is tracked for the whole aggregate, per entity expiry would need a
// different 404 semantic (partial results) that no client understands
