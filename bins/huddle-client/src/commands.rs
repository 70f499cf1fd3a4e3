use huddle_core::MeshCommand;

/// Parse one line typed on stdin.
pub fn parse(line: &str) -> Option<MeshCommand> {
    let words: Vec<String> = line
        .split_whitespace()
        .map(|w| w.to_ascii_lowercase())
        .collect();
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["mute"] => Some(MeshCommand::SetAudio(false)),
        ["unmute"] => Some(MeshCommand::SetAudio(true)),
        ["video", "off"] => Some(MeshCommand::SetVideo(false)),
        ["video", "on"] => Some(MeshCommand::SetVideo(true)),
        ["pause"] => Some(MeshCommand::SetOutgoing(false)),
        ["resume"] => Some(MeshCommand::SetOutgoing(true)),
        ["quit"] | ["exit"] => Some(MeshCommand::Shutdown),
        _ => None,
    }
}

pub const HELP: &str = "commands: mute, unmute, video off, video on, pause, resume, quit";
