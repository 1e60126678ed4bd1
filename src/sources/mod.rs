//! Reference source implementations: a key/value batch-function source, a
//! schema/association-aware relational source, and a controllable
//! test-double source.

pub mod kv;
pub mod relational;
pub mod test_double;
