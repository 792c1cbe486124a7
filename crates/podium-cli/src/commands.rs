//! Host console commands.

use podium_core::protocol::Point;
use podium_session::SessionStateStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostCommand {
    Next,
    Prev,
    Goto(u64),
    Zoom(f64),
    Pan(f64, f64),
    Laser(Option<Point>),
    Quit,
}

impl HostCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".into());
        };
        let args: Vec<&str> = words.collect();

        let command = match (verb, args.as_slice()) {
            ("next", []) => HostCommand::Next,
            ("prev", []) => HostCommand::Prev,
            ("goto", [n]) => HostCommand::Goto(
                n.parse()
                    .map_err(|_| format!("goto expects a step number, got `{n}`"))?,
            ),
            ("zoom", [z]) => {
                let zoom = number(z)?;
                if zoom <= 0.0 {
                    return Err("zoom must be positive".into());
                }
                HostCommand::Zoom(zoom)
            }
            ("pan", [x, y]) => HostCommand::Pan(number(x)?, number(y)?),
            ("laser", ["off"]) => HostCommand::Laser(None),
            ("laser", [x, y]) => HostCommand::Laser(Some(Point::new(number(x)?, number(y)?))),
            ("quit" | "exit", []) => HostCommand::Quit,
            _ => return Err(format!("unknown command: {}", line.trim())),
        };
        Ok(command)
    }

    /// Mutate local state. Returns whether anything changed.
    pub fn apply(self, state: &SessionStateStore) -> bool {
        match self {
            HostCommand::Next => state.update(|s| s.global_step = s.global_step.saturating_add(1)),
            HostCommand::Prev => state.update(|s| s.global_step = s.global_step.saturating_sub(1)),
            HostCommand::Goto(step) => state.set_global_step(step),
            HostCommand::Zoom(zoom) => state.update(|s| s.shared_viewport.zoom_level = zoom),
            HostCommand::Pan(x, y) => {
                state.update(|s| s.shared_viewport.pan_offset = Point::new(x, y))
            }
            HostCommand::Laser(position) => state.set_laser_position(position),
            HostCommand::Quit => false,
        }
    }
}

fn number(raw: &str) -> Result<f64, String> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("expected a number, got `{raw}`"))
}
