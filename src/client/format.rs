//! Output formatting for the page client.
//!
//! One line per delivery on stdout: the page function, a tab, then the
//! JSON-RPC text as received. Piping into `cut -f2 | jq` works.

use super::page_client::CallFrame;

pub fn format_call(call: &CallFrame) -> String {
    format!("{}\t{}", call.function, call.payload)
}

pub fn print_call(call: &CallFrame) {
    println!("{}", format_call(call));
}
