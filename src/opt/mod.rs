//! Compiler hints that do not change behavior, only code shape.

pub mod hint;
