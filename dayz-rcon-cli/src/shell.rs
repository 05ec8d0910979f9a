use crossterm::tty::IsTty;
use rustyline_async::{Readline, ReadlineError, SharedWriter};
use std::fmt::Display;
use std::io::{Stderr, Stdout, Write};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

pub struct ShellRead {
    prompt: String,
    inner: ShellReadInner,
}

/// Where output goes. With a line editor active everything has to go through it, otherwise
/// printed lines would tear through the prompt.
#[derive(Clone)]
pub struct ShellWrite {
    inner: ShellWriteInner,
}

enum ShellReadInner {
    Interactive(Readline, SharedWriter),
    Stream(Lines<BufReader<Stdin>>),
}

enum ShellWriteInner {
    Interactive(SharedWriter),
    Stream(Stdout, Stderr),
}

pub fn new_shell(
    prompt: String,
    disable_interactive: bool,
) -> Result<(ShellRead, ShellWrite), ReadlineError> {
    if !disable_interactive && std::io::stdout().is_tty() {
        let (read_line, writer) = Readline::new(prompt.clone())?;
        Ok((
            ShellRead {
                prompt,
                inner: ShellReadInner::Interactive(read_line, writer.clone()),
            },
            ShellWrite {
                inner: ShellWriteInner::Interactive(writer),
            },
        ))
    } else {
        Ok((
            ShellRead {
                prompt,
                inner: ShellReadInner::Stream(BufReader::new(tokio::io::stdin()).lines()),
            },
            ShellWrite {
                inner: ShellWriteInner::Stream(std::io::stdout(), std::io::stderr()),
            },
        ))
    }
}

impl ShellRead {
    /// Next line of input, or `None` once piped input runs out.
    pub async fn read_line(&mut self) -> Option<String> {
        match &mut self.inner {
            ShellReadInner::Interactive(read, writer) => {
                let line = match read.readline().await {
                    Ok(line) => line,
                    Err(ReadlineError::IO(err)) => {
                        eprintln!("An error occurred: {}", err);
                        proc_exit::Code::UNKNOWN.process_exit();
                    }
                    Err(ReadlineError::Eof | ReadlineError::Closed) => {
                        proc_exit::Code::SIGHUP.process_exit()
                    }
                    Err(ReadlineError::Interrupted) => proc_exit::Code::SIGINT.process_exit(),
                };

                read.add_history_entry(line.clone());

                // echo back the line
                let _ = writeln!(writer, "{}{}", self.prompt, line);

                Some(line)
            }
            ShellReadInner::Stream(lines) => match lines.next_line().await {
                Ok(line) => line,
                Err(err) => {
                    eprintln!("An error occurred: {}", err);
                    proc_exit::Code::UNKNOWN.process_exit();
                }
            },
        }
    }
}

impl ShellWrite {
    pub fn out(&mut self) -> &mut dyn Write {
        match &mut self.inner {
            ShellWriteInner::Interactive(writer) => writer,
            ShellWriteInner::Stream(stdout, _) => stdout,
        }
    }

    pub fn err(&mut self) -> &mut dyn Write {
        match &mut self.inner {
            ShellWriteInner::Interactive(writer) => writer,
            ShellWriteInner::Stream(_, stderr) => stderr,
        }
    }

    pub fn line(&mut self, text: impl Display) {
        let _ = writeln!(self.out(), "{}", text);
    }

    pub fn error(&mut self, text: impl Display) {
        let _ = writeln!(self.err(), "{}", text);
    }
}

impl Clone for ShellWriteInner {
    fn clone(&self) -> Self {
        match self {
            ShellWriteInner::Interactive(w) => ShellWriteInner::Interactive(w.clone()),
            ShellWriteInner::Stream(_, _) => {
                ShellWriteInner::Stream(std::io::stdout(), std::io::stderr())
            }
        }
    }
}
