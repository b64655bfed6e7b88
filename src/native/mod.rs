/// Native module contains the in-process implementation of the sandbox:
/// a Python-subset interpreter running on dedicated isolate threads,
/// without any external runtime.
pub mod interpreter;
pub mod sandbox;
