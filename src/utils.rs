use tokio::sync::mpsc;

/// A terminal printout. Verbosity level is from low to high.
/// - `0`: always printed
/// - `2`: very verbose, shows engine internals
pub struct Printout {
    pub verbosity: u8,
    pub content: String,
}

pub type PrintSender = mpsc::UnboundedSender<Printout>;
pub type PrintReceiver = mpsc::UnboundedReceiver<Printout>;

/// Create a printout channel. The embedding application drains the receiver.
pub fn print_channel() -> (PrintSender, PrintReceiver) {
    mpsc::unbounded_channel()
}

/// Create a terminal printout at verbosity level 0.
pub fn print_loud(print_tx: &PrintSender, content: &str) {
    let _ = print_tx.send(Printout {
        verbosity: 0,
        content: content.into(),
    });
}

/// Create a terminal printout at verbosity level 2.
pub fn print_debug(print_tx: &PrintSender, content: &str) {
    let _ = print_tx.send(Printout {
        verbosity: 2,
        content: content.into(),
    });
}

/// Random identifier for one attached link.
pub fn conn_id() -> u64 {
    rand::random()
}
