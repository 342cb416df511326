/// A size-rotated, append-only log file usable as a `fern` output.
pub mod rotating_file;
