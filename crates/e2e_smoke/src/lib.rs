// Tests-only crate; see tests/smoke.rs.
