// src/tests/mod.rs

mod middleware_tests;
