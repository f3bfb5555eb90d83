use crate::game::EpisodeEnd;
use crate::pos::Pos;
use crate::replay::Frame;

const HEAD: char = '@';
const BODY: char = 'o';
const FOOD: char = '*';
const WALL: char = '#';
const POISON: char = 'x';
const BONUS: char = '$';
const EMPTY: char = '·';

/// Render a replay frame as a boxed text grid followed by a status line.
pub fn render_frame(frame: &Frame) -> String {
    let size = frame.grid_size;
    let mut cells = vec![vec![EMPTY; size]; size];
    let mut paint = |points: &[Pos], ch: char| {
        for p in points.iter().filter(|p| p.in_bounds(size)) {
            cells[p.y as usize][p.x as usize] = ch;
        }
    };
    paint(&frame.walls, WALL);
    paint(&frame.poisons, POISON);
    paint(&frame.bonuses, BONUS);
    paint(&frame.food, FOOD);
    if let Some((head, tail)) = frame.body.split_first() {
        paint(tail, BODY);
        paint(std::slice::from_ref(head), HEAD);
    }

    let mut out = String::with_capacity((size + 3) * (size + 4));
    out.push('╔');
    out.extend(std::iter::repeat_n('═', size));
    out.push_str("╗\n");
    for row in &cells {
        out.push('║');
        out.extend(row.iter());
        out.push_str("║\n");
    }
    out.push('╚');
    out.extend(std::iter::repeat_n('═', size));
    out.push_str("╝\n");
    out.push_str(&status_line(frame));
    out
}

fn status_line(frame: &Frame) -> String {
    let state = match frame.outcome {
        None => "running",
        Some(EpisodeEnd::Collided) => "collided",
        Some(EpisodeEnd::Starved) => "starved",
        Some(EpisodeEnd::Poisoned) => "poisoned",
        Some(EpisodeEnd::Victory) => "victory",
        Some(EpisodeEnd::StepLimit) => "step limit",
    };
    format!(
        "length {} | steps {} | hunger {} | fitness {:.1} | {}",
        frame.body.len(),
        frame.steps,
        frame.hunger,
        frame.fitness,
        state
    )
}
