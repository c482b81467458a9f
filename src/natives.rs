//! Native functions installed into the globals table at `Vm::new`. Kept to
//! the one the test suite and the rest of this codebase actually lean on;
//! a real deployment would grow this table the same way, one `fn` at a time.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::object::NativeFn;
use crate::value::Value;

/// Seconds since the Unix epoch, as a float. The canonical Lox native used
/// to benchmark recursive calls.
fn clock(args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(format!("Expected 0 arguments but got {}.", args.len()));
    }
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "System clock is set before the Unix epoch.".to_string())?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}

pub const NATIVES: &[(&str, NativeFn)] = &[("clock", clock)];
