// src/rules/tests/mod.rs
