//! End to end tests against deployed services, see the `system_tests` and
//! `load_tests` features.
