use log::{trace, warn};

/// Split a configured command line into the program and its arguments.
///
/// The command is split with shell quoting rules but never run by a shell, so
/// variables, pipes and redirections are passed to the program literally.
/// Returns `None` for empty command lines or unbalanced quotes.
pub fn split_command(command_line: &str) -> Option<(String, Vec<String>)> {
    let contains_variables = command_line
        .find('$')
        .and_then(|pos| command_line[pos + 1..].chars().next())
        .map(|ch| ch.is_ascii_alphabetic() || ch == '{')
        == Some(true);

    let contains_suspicious = command_line.contains(" | ")
        || command_line.contains(" && ")
        || command_line.contains(" || ")
        || command_line.contains(" > ");

    if contains_variables || contains_suspicious {
        warn!("The action {command_line:?} contains a variable or other shell-specific syntax, but it is not run in a shell: wrap it in a script.")
    }

    let mut words = shlex::split(command_line)?;
    if words.is_empty() {
        return None;
    }
    let program = words.remove(0);

    trace!("Parsed {command_line:?} to {program:?} {words:?}.");

    Some((program, words))
}
