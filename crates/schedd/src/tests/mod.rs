//! Behavioural suites for the scheduler daemon.

pub(crate) mod support;
