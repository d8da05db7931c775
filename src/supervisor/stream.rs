/// Stream of output events from a worker process, either stdout or stderr.
#[derive(Debug)]
pub enum OutputEvent {
    Stdout(String),
    Stderr(String),
}
