/// Unit tests for the broker's building blocks
mod catalog_tests;
mod tools_tests;
