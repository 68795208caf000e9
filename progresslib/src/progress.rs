mod format;

use format::{BinarySize, ClockDuration, DecimalCount, HumanDuration};

use std::{
    collections::VecDeque,
    io::Write,
    time::{Duration, Instant},
};

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    QueueableCommand,
    Result,
    style::{Print, Stylize},
    terminal::{self, Clear, ClearType},
    tty::IsTty,
};

/// Moving average of the progress rate over a fixed window.
#[derive(Debug)]
pub struct ProgressSpeed {
    window: Duration,
    /// (time, position) samples, oldest first
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressSpeed {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record_value(&mut self, value: u64) {
        let now = Instant::now();
        self.samples.push_back((now, value));

        // Keep one sample older than the window so the full window is covered
        while self.samples.len() > 2 && now - self.samples[1].0 >= self.window {
            self.samples.pop_front();
        }
    }

    /// Progress units per second.
    pub fn units_per_sec(&self) -> f64 {
        if let (Some(f), Some(b)) = (self.samples.front(), self.samples.back()) {
            let secs = (b.0 - f.0).as_secs_f64();
            if secs > 0.0 {
                return b.1.saturating_sub(f.1) as f64 / secs;
            }
        }

        0.0
    }
}

/// What the progress values count.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressUnit {
    /// Shown with binary prefixes, eg. `1.50MiB`
    Bytes,
    /// Shown with decimal prefixes, eg. `1.50M`
    Items,
}

impl ProgressUnit {
    fn format(self, value: u64) -> String {
        match self {
            Self::Bytes => BinarySize(value).to_string(),
            Self::Items => DecimalCount(value).to_string(),
        }
    }
}

/// How the progress bar should be drawn
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressDrawMode {
    /// Overwrite the same line on every frame. The default rate is 15 fps.
    Interactive,
    /// Append a new line on every frame. Used when the output is not a
    /// terminal or when verbose logging would interleave with the bar. The
    /// default rate is 0.2 fps.
    Append,
    /// Do not draw anything.
    None,
}

impl ProgressDrawMode {
    fn default_fps(self) -> f64 {
        match self {
            Self::Interactive => 15.0,
            Self::Append => 0.2,
            Self::None => 0.0,
        }
    }

    fn detect(term: &impl IsTty) -> Self {
        if term.is_tty() {
            Self::Interactive
        } else {
            Self::Append
        }
    }
}

/// Progress bar showing the elapsed time, position, percentage, average
/// speed, and ETA of a long running operation.
pub struct ProgressBar<T: Write + IsTty> {
    len: u64,
    pos: u64,
    unit: ProgressUnit,
    /// Shown before the bar
    label: String,
    term: T,
    mode: ProgressDrawMode,
    /// Maximum frames per second
    fps: f64,
    last_draw: Option<Instant>,
    started: Instant,
    speed: ProgressSpeed,
}

impl<T: Write + IsTty> ProgressBar<T> {
    /// Construct a new progress bar counting bytes. The draw mode is picked
    /// based on whether `term` is a terminal.
    pub fn new(term: T, len: u64) -> Self {
        let mode = ProgressDrawMode::detect(&term);

        Self {
            len,
            pos: 0,
            unit: ProgressUnit::Bytes,
            label: String::new(),
            term,
            mode,
            fps: mode.default_fps(),
            last_draw: None,
            started: Instant::now(),
            speed: ProgressSpeed::new(Duration::from_secs(10)),
        }
    }

    pub fn with_unit(mut self, unit: ProgressUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn unit(&self) -> ProgressUnit {
        self.unit
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Set the text shown before the bar. Takes effect on the next draw.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    pub fn mode(&self) -> ProgressDrawMode {
        self.mode
    }

    /// Set the draw mode. [`None`] picks [`ProgressDrawMode::Interactive`]
    /// or [`ProgressDrawMode::Append`] depending on whether the output is a
    /// terminal. This resets the fps to the mode's default.
    pub fn set_mode(&mut self, mode: Option<ProgressDrawMode>) {
        self.mode = mode.unwrap_or_else(|| ProgressDrawMode::detect(&self.term));
        self.fps = self.mode.default_fps();
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Set the maximum rendering rate. Zero disables rate limiting.
    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
    }

    pub fn length(&self) -> u64 {
        self.len
    }

    /// Set the maximum value and redraw immediately.
    pub fn set_length(&mut self, len: u64) -> Result<()> {
        self.len = len;
        self.draw(true)
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Advance the current value. Redraws subject to the rate limit.
    pub fn advance(&mut self, delta: u64) -> Result<()> {
        self.pos = self.pos.saturating_add(delta);
        self.speed.record_value(self.pos);
        self.draw(false)
    }

    /// Draw the final frame. In interactive mode, the bar is cleared from the
    /// terminal instead. Called automatically on drop.
    pub fn finish(&mut self) -> Result<()> {
        match self.mode {
            ProgressDrawMode::Interactive => {
                self.term
                    .queue(Clear(ClearType::CurrentLine))?
                    .queue(MoveToColumn(0))?
                    .queue(Show)?
                    .flush()?;
            }
            ProgressDrawMode::Append => self.draw(true)?,
            ProgressDrawMode::None => {}
        }
        Ok(())
    }

    fn render(&self) -> String {
        let elapsed = Duration::from_secs(self.started.elapsed().as_secs());
        let ratio = if self.len == 0 {
            0.0
        } else {
            (self.pos as f64 / self.len as f64).clamp(0.0, 1.0)
        };

        format!(
            "[{elapsed}] {label}{sep}{bar_placeholder}{percent:.0}% {pos}/{len} ({speed}/s, {eta})",
            elapsed = ClockDuration(elapsed),
            label = self.label,
            sep = if self.label.is_empty() { "" } else { " " },
            bar_placeholder = if self.mode == ProgressDrawMode::Interactive {
                "\x00"
            } else {
                ""
            },
            percent = ratio * 100.0,
            pos = self.unit.format(self.pos),
            len = self.unit.format(self.len),
            speed = self.unit.format(self.speed.units_per_sec() as u64),
            eta = HumanDuration(self.eta()),
        )
    }

    /// Draw the bar. Unless `force` is set, the draw is skipped if the last
    /// frame was too recent.
    pub fn draw(&mut self, force: bool) -> Result<()> {
        if self.mode == ProgressDrawMode::None {
            return Ok(());
        }

        if let (false, true, Some(last)) = (force, self.fps > 0.0, self.last_draw) {
            if last.elapsed() < Duration::from_secs_f64(1.0 / self.fps) {
                return Ok(());
            }
        }

        let mut result = self.render();

        if self.mode == ProgressDrawMode::Interactive {
            let term_width = terminal::size().unwrap_or((80, 24)).0 as usize;
            // The placeholder takes the place of the space after the bar
            let bar_width = term_width.saturating_sub(result.chars().count());
            let ratio = if self.len == 0 { 0.0 } else { self.pos as f64 / self.len as f64 };
            let consumed = (ratio.clamp(0.0, 1.0) * bar_width as f64).round() as usize;
            let remaining = bar_width.saturating_sub(consumed);

            result = if bar_width == 0 {
                result.replace('\x00', "")
            } else {
                result.replace('\x00', &format!(
                    "{}{} ",
                    "#".repeat(consumed).cyan(),
                    "-".repeat(remaining).blue(),
                ))
            };

            self.term
                .queue(Hide)?
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?;
        } else {
            result.push('\n');
        }

        self.term
            .queue(Print(result))?
            .flush()?;

        self.last_draw = Some(Instant::now());

        Ok(())
    }

    fn eta(&self) -> Duration {
        let s = self.speed.units_per_sec();
        if s > 0.0 {
            Duration::from_secs(((self.len.saturating_sub(self.pos)) as f64 / s) as u64)
        } else {
            Duration::ZERO
        }
    }
}

impl<T: Write + IsTty> Drop for ProgressBar<T> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        io::{self, Error, ErrorKind},
        rc::Rc,
        str,
        thread,
    };

    use super::*;

    #[derive(Clone)]
    struct TestTerm {
        buf: Rc<RefCell<String>>,
        tty: bool,
    }

    impl TestTerm {
        fn new(tty: bool) -> Self {
            Self {
                buf: Rc::new(RefCell::new(String::new())),
                tty,
            }
        }

        fn take(&self) -> String {
            self.buf.take()
        }
    }

    impl Write for TestTerm {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let s = str::from_utf8(buf)
                .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
            self.buf.borrow_mut().push_str(s);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl IsTty for TestTerm {
        fn is_tty(&self) -> bool {
            self.tty
        }
    }

    #[test]
    fn test_speed() {
        let mut speed = ProgressSpeed::new(Duration::from_secs(10));
        assert_eq!(speed.units_per_sec(), 0.0);

        speed.record_value(0);
        assert_eq!(speed.units_per_sec(), 0.0);

        thread::sleep(Duration::from_millis(20));
        speed.record_value(1000);
        assert!(speed.units_per_sec() > 0.0);
    }

    #[test]
    fn test_hidden() {
        let term = TestTerm::new(false);
        let mut bar = ProgressBar::new(term.clone(), 10);

        bar.set_mode(Some(ProgressDrawMode::None));
        assert_eq!(bar.mode(), ProgressDrawMode::None);
        assert_eq!(bar.fps(), 0.0);

        bar.advance(5).unwrap();
        assert_eq!(bar.position(), 5);
        bar.set_length(15).unwrap();
        assert_eq!(bar.length(), 15);

        drop(bar);

        assert_eq!(term.take(), "");
    }

    #[test]
    fn test_append_bytes() {
        let term = TestTerm::new(false);
        let mut bar = ProgressBar::new(term.clone(), 2048);

        assert_eq!(bar.mode(), ProgressDrawMode::Append);
        assert_eq!(bar.unit(), ProgressUnit::Bytes);
        assert_eq!(bar.fps(), 0.2);

        bar.set_fps(0.0);
        bar.advance(1024).unwrap();
        let output = term.take();
        let pieces: Vec<&str> = output.split(' ').collect();
        assert_eq!(pieces[1], "50%");
        assert_eq!(pieces[2], "1.00KiB/2.00KiB");
        assert!(output.ends_with('\n'));

        drop(bar);
        assert!(!term.take().is_empty());
    }

    #[test]
    fn test_append_items_with_label() {
        let term = TestTerm::new(false);
        let mut bar = ProgressBar::new(term.clone(), 4_000_000)
            .with_unit(ProgressUnit::Items);
        bar.set_label("Searching");
        assert_eq!(bar.label(), "Searching");

        bar.advance(1_000_000).unwrap();
        let output = term.take();
        let pieces: Vec<&str> = output.split(' ').collect();
        assert_eq!(pieces[1], "Searching");
        assert_eq!(pieces[2], "25%");
        assert_eq!(pieces[3], "1.00M/4.00M");
    }

    #[test]
    fn test_rate_limit() {
        let term = TestTerm::new(false);
        let mut bar = ProgressBar::new(term.clone(), 10);
        bar.set_fps(0.001);

        // The first frame is never delayed
        bar.advance(1).unwrap();
        assert!(!term.take().is_empty());

        bar.advance(1).unwrap();
        assert_eq!(term.take(), "");

        bar.draw(true).unwrap();
        assert!(!term.take().is_empty());
    }

    #[test]
    fn test_zero_length() {
        let term = TestTerm::new(false);
        let mut bar = ProgressBar::new(term.clone(), 0);

        bar.set_length(0).unwrap();
        let output = term.take();
        let pieces: Vec<&str> = output.split(' ').collect();
        assert_eq!(pieces[1], "0%");
    }

    #[test]
    fn test_interactive() {
        let term = TestTerm::new(true);
        let mut bar = ProgressBar::new(term.clone(), 10);

        assert_eq!(bar.mode(), ProgressDrawMode::Interactive);
        assert_eq!(bar.fps(), 15.0);

        bar.set_fps(0.0);
        bar.advance(1).unwrap();
        let output = term.take();
        let pieces: Vec<&str> = output.split(' ').collect();
        assert!(pieces[1].starts_with("\u{1b}"));
        assert_eq!(pieces[2], "10%");
        assert_eq!(pieces[3], "1B/10B");
        assert!(!output.ends_with('\n'));

        drop(bar);
        assert!(!term.take().contains('%'));
    }
}
