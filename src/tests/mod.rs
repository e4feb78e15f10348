//! Unit tests for the shadow paging crate.
//!
//! Everything runs against [`mock::MockVcpu`], whose guest memory is a set of
//! heap pages, and [`mock::TestHal`], which hands out heap pages as frames.


mod ctrl_regs;
mod invlpg;
