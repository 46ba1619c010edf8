use super::{Color, VgaChar, VgaMem, HEIGHT, WIDTH};

/// A scrolling text console on top of a VGA buffer.
pub struct Writer {
    mem: VgaMem,
    column: usize,
    row: usize,
    fg: Color,
    bg: Color,
}

impl Writer {
    pub fn new(mem: VgaMem) -> Writer {
        Writer::with_colors(mem, Color::LightGray, Color::Black)
    }

    pub fn with_colors(mem: VgaMem, fg: Color, bg: Color) -> Writer {
        Writer {
            mem,
            column: 0,
            row: 0,
            fg,
            bg,
        }
    }

    pub fn clear(&mut self) {
        let blank = VgaChar::new(self.fg, self.bg, b' ');
        for index in 0..WIDTH * HEIGHT {
            self.mem.write(index, blank);
        }
        self.column = 0;
        self.row = 0;
    }

    pub fn write_char(&mut self, ch: u8) {
        match ch {
            b'\n' => self.newline(),
            b'\r' => self.column = 0,
            ch => {
                if self.column == WIDTH {
                    self.newline();
                }
                let cell = self.row * WIDTH + self.column;
                self.mem.write(cell, VgaChar::new(self.fg, self.bg, ch));
                self.column += 1;
            }
        }
    }

    fn newline(&mut self) {
        self.column = 0;
        if self.row + 1 < HEIGHT {
            self.row += 1;
            return;
        }
        // scroll everything up one row and blank the last one
        for index in WIDTH..WIDTH * HEIGHT {
            let ch = self.mem.read(index);
            self.mem.write(index - WIDTH, ch);
        }
        let blank = VgaChar::new(self.fg, self.bg, b' ');
        for column in 0..WIDTH {
            self.mem.write((HEIGHT - 1) * WIDTH + column, blank);
        }
    }
}

impl core::fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for ch in s.bytes() {
            if ch <= 0x7F {
                self.write_char(ch);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use i386::VirtAddr;

    fn make_writer(cells: &mut Vec<u16>) -> Writer {
        cells.resize(WIDTH * HEIGHT, 0);
        let mem = unsafe { VgaMem::from_addr(VirtAddr(cells.as_mut_ptr() as usize)) };
        let mut writer = Writer::new(mem);
        writer.clear();
        writer
    }

    fn row_text(cells: &[u16], row: usize) -> String {
        cells[row * WIDTH..row * WIDTH + WIDTH]
            .iter()
            .map(|cell| (cell & 0xFF) as u8 as char)
            .collect::<String>()
            .trim_end()
            .to_string()
    }

    #[test]
    fn writes_and_advances() {
        let mut cells = Vec::new();
        let mut writer = make_writer(&mut cells);
        writer.write_char(b'h');
        writer.write_char(b'i');
        writer.write_char(b'\n');
        writer.write_char(b'!');
        assert_eq!(row_text(&cells, 0), "hi");
        assert_eq!(row_text(&cells, 1), "!");
    }

    #[test]
    fn scrolls_when_full() {
        let mut cells = Vec::new();
        let mut writer = make_writer(&mut cells);
        for row in 0..HEIGHT {
            writer.write_char(b'a' + (row % 26) as u8);
            writer.write_char(b'\n');
        }
        // the first line has scrolled off
        assert_eq!(row_text(&cells, 0), "b");
        assert_eq!(row_text(&cells, HEIGHT - 1), "");
    }
}
