//! Interactive shell: the task-context consumer of the keyboard mailbox.
//!
//! Keeps a local line buffer with a movable cursor. Redraws mask the
//! hardware cursor and recompute absolute screen coordinates so editing
//! in the middle of a wrapped line does not flicker or ghost.

use x86_64::instructions::port::Port;

use crate::keyboard::{self, KEY_ARROW_LEFT, KEY_ARROW_RIGHT, KEY_BACKSPACE, KEY_ENTER};
use crate::pit;
use crate::pmm::PMM;
use crate::task::{self, KillError, TaskState};
use crate::vga::{self, VGA_WRITER};
use crate::{heap, pic, vprint, vprintln};

const MAX_LINE: usize = 256;
const PROMPT: &str = "basalt> ";
const SCREEN_WIDTH: usize = 80;

struct Shell {
    buffer: [u8; MAX_LINE],
    len: usize,
    cursor: usize,
    prompt_row: usize,
}

pub extern "C" fn shell_task() {
    let mut shell = Shell::new();
    vprintln!("type 'help' for commands");
    shell.prompt();
    loop {
        let key = keyboard::wait_for_key();
        shell.input(key);
    }
}

impl Shell {
    fn new() -> Self {
        Self {
            buffer: [0; MAX_LINE],
            len: 0,
            cursor: 0,
            prompt_row: 0,
        }
    }

    /// Resets the line state and prints a fresh prompt at the current row.
    fn prompt(&mut self) {
        self.len = 0;
        self.cursor = 0;
        self.prompt_row = vga::get_cursor_y();
        vprint!("{}", PROMPT);
        self.place_cursor();
        vga::show_hardware_cursor();
    }

    /// Moves the hardware cursor to the logical position, accounting for
    /// wrapped lines.
    fn place_cursor(&self) {
        let total = PROMPT.len() + self.cursor;
        vga::set_cursor(total % SCREEN_WIDTH, self.prompt_row + total / SCREEN_WIDTH);
    }

    /// Repaints the buffer after an edit. The cursor is hidden while
    /// characters go out so it does not ghost across the line.
    fn redraw(&self) {
        vga::hide_hardware_cursor();
        {
            let mut writer = VGA_WRITER.lock();
            writer.set_position(PROMPT.len(), self.prompt_row);
            for &b in &self.buffer[..self.len] {
                writer.put_char(b as char);
            }
            // Erase the character a backspace may have left behind.
            writer.put_char(' ');
        }
        self.place_cursor();
        vga::show_hardware_cursor();
    }

    fn input(&mut self, key: i8) {
        match key {
            KEY_ENTER => {
                vprintln!();
                let line = core::str::from_utf8(&self.buffer[..self.len])
                    .unwrap_or("")
                    .trim();
                // Borrow dance: run the command on a copy so the buffer
                // can be reset afterwards.
                let mut copy = [0u8; MAX_LINE];
                let n = line.len();
                copy[..n].copy_from_slice(line.as_bytes());
                if let Ok(cmd) = core::str::from_utf8(&copy[..n]) {
                    self.run_command(cmd);
                }
                self.prompt();
            }
            KEY_BACKSPACE => {
                if self.cursor > 0 {
                    for i in self.cursor - 1..self.len - 1 {
                        self.buffer[i] = self.buffer[i + 1];
                    }
                    self.len -= 1;
                    self.cursor -= 1;
                    self.redraw();
                }
            }
            KEY_ARROW_LEFT => {
                if self.cursor > 0 {
                    self.cursor -= 1;
                    self.redraw();
                }
            }
            KEY_ARROW_RIGHT => {
                if self.cursor < self.len {
                    self.cursor += 1;
                    self.redraw();
                }
            }
            c if (32..=126).contains(&c) && self.len < MAX_LINE - 1 => {
                for i in (self.cursor..self.len).rev() {
                    self.buffer[i + 1] = self.buffer[i];
                }
                self.buffer[self.cursor] = c as u8;
                self.len += 1;
                self.cursor += 1;
                self.redraw();
            }
            _ => {}
        }
    }

    fn run_command(&mut self, cmd: &str) {
        let mut parts = cmd.split_whitespace();
        match parts.next() {
            None => {}
            Some("help") => {
                vprintln!("commands:");
                vprintln!("  help        - this message");
                vprintln!("  clear       - clear the screen");
                vprintln!("  mem         - physical memory and heap usage");
                vprintln!("  ticks       - timer ticks and uptime");
                vprintln!("  tasks       - list tasks on the ready ring");
                vprintln!("  kill <pid>  - remove a task");
                vprintln!("  irq         - PIC request/service registers");
                vprintln!("  reboot      - reset via the PS/2 controller");
            }
            Some("clear") => {
                VGA_WRITER.lock().clear_screen();
            }
            Some("mem") => {
                vprintln!("physical memory:");
                vprintln!("  total: {} KiB", PMM.get_total_kb());
                vprintln!("  used:  {} KiB", PMM.get_used_kb());
                vprintln!("  free:  {} KiB", PMM.get_free_kb());
                vprintln!("heap free: {} bytes", heap::free_bytes());
            }
            Some("ticks") => {
                vprintln!("{} ticks ({} s uptime)", pit::ticks(), pit::uptime_secs());
            }
            Some("tasks") => {
                vprintln!("  pid  state    entry              name");
                for info in task::snapshot() {
                    let name_len = info.name.iter().position(|&b| b == 0).unwrap_or(16);
                    let name = core::str::from_utf8(&info.name[..name_len]).unwrap_or("?");
                    vprintln!(
                        "  {:<4} {:<8} {:#018x} {}",
                        info.pid,
                        state_name(info.state),
                        info.entry,
                        name
                    );
                }
            }
            Some("kill") => match parts.next().and_then(|p| p.parse::<i32>().ok()) {
                None => vprintln!("usage: kill <pid>"),
                Some(pid) => match task::kill(pid) {
                    Ok(()) => vprintln!("task {} killed", pid),
                    Err(KillError::NotFound) => vprintln!("no such task: {}", pid),
                    Err(KillError::IsCurrent) => vprintln!("cannot kill the current task"),
                },
            },
            Some("irq") => {
                vprintln!("irr: {:#06x}  isr: {:#06x}", pic::read_irr(), pic::read_isr());
            }
            Some("reboot") => {
                vprintln!("resetting...");
                unsafe {
                    Port::<u8>::new(0x64).write(0xFEu8);
                }
            }
            Some(other) => {
                vprintln!("unknown command: '{}'. type 'help'.", other);
            }
        }
    }
}

fn state_name(state: TaskState) -> &'static str {
    match state {
        TaskState::Ready => "ready",
        TaskState::Running => "running",
        TaskState::Blocked => "blocked",
        TaskState::Zombie => "zombie",
    }
}
