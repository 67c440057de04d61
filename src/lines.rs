/// Splits a subprocess's raw output chunks into complete lines.
///
/// yt-dlp (with `--newline`) terminates lines with `\n`, but the ffmpeg
/// stages it drives redraw progress with bare `\r`, so both count as
/// terminators. The trailing partial line is kept as raw bytes until more
/// input arrives, so a UTF-8 sequence split across chunk boundaries is not
/// mangled.
#[derive(Debug, Default)]
pub struct LineDemuxer {
    buf: Vec<u8>,
}

impl LineDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, get back every line completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, b) in self.buf.iter().enumerate() {
            if *b == b'\n' || *b == b'\r' {
                lines.push(String::from_utf8_lossy(&self.buf[start..i]).into_owned());
                start = i + 1;
            }
        }
        self.buf.drain(..start);
        lines
    }

    /// Flush the buffered tail at end of stream, if any.
    pub fn finish(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }
}
