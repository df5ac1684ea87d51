// Line-oriented shell over the keyboard ring and the VGA console.
// Commands tokenize on whitespace; tag literals are `key:value`, split
// on the first colon. Everything except `help` and `login` requires an
// authenticated session, and the destructive commands additionally
// require the admin role.

use crate::block::BlockDevice;
use crate::tagfs::{Tag, TagFs, TagFsError, TAG_NAME, TAG_OWNER};
use crate::{heap, pit};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};

/// Most results a single listing will print.
const LIST_LIMIT: usize = 64;

/// Built-in accounts; TagFS records the creator in the `owner` tag.
pub struct User {
    pub name: &'static str,
    password: &'static str,
    pub admin: bool,
}

static USERS: [User; 2] = [
    User {
        name: "root",
        password: "boxroot",
        admin: true,
    },
    User {
        name: "box",
        password: "box",
        admin: false,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellError {
    NotLoggedIn,
    PermissionDenied,
    UnknownCommand,
    BadArguments(&'static str),
    LoginFailed,
    NotFound,
    Fs(TagFsError),
}

impl From<TagFsError> for ShellError {
    fn from(error: TagFsError) -> Self {
        ShellError::Fs(error)
    }
}

impl fmt::Display for ShellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellError::NotLoggedIn => f.write_str("login required"),
            ShellError::PermissionDenied => f.write_str("admin privileges required"),
            ShellError::UnknownCommand => f.write_str("unknown command (try help)"),
            ShellError::BadArguments(usage) => write!(f, "usage: {}", usage),
            ShellError::LoginFailed => f.write_str("login failed"),
            ShellError::NotFound => f.write_str("no such file"),
            ShellError::Fs(error) => write!(f, "{}", error),
        }
    }
}

/// Side effect a command asks the kernel loop to perform after its
/// output has been printed. Keeps the command layer free of direct
/// hardware pokes and therefore testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellAction {
    None,
    ClearScreen,
    Reboot,
    Shutdown,
}

pub struct Shell {
    user: Option<&'static User>,
}

impl Shell {
    pub const fn new() -> Self {
        Shell { user: None }
    }

    pub fn current_user(&self) -> Option<&'static User> {
        self.user
    }

    fn require_login(&self) -> Result<&'static User, ShellError> {
        self.user.ok_or(ShellError::NotLoggedIn)
    }

    fn require_admin(&self) -> Result<&'static User, ShellError> {
        let user = self.require_login()?;
        if !user.admin {
            return Err(ShellError::PermissionDenied);
        }
        Ok(user)
    }

    /// Parse a `key:value` literal, split on the first colon.
    pub fn parse_tag(literal: &str) -> Result<Tag, ShellError> {
        let (key, value) = literal
            .split_once(':')
            .ok_or(ShellError::BadArguments("tag literal is key:value"))?;
        if key.is_empty() {
            return Err(ShellError::BadArguments("tag literal is key:value"));
        }
        Tag::new(key, value).map_err(ShellError::from)
    }

    /// Execute one input line. Output goes to `out`; the returned action
    /// is performed by the caller.
    pub fn execute<D: BlockDevice>(
        &mut self,
        line: &str,
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            return Ok(ShellAction::None);
        };
        let args = &tokens[1..];

        match command {
            "help" => self.cmd_help(out),
            "login" => self.cmd_login(args, out),
            "clear" => {
                self.require_login()?;
                Ok(ShellAction::ClearScreen)
            }
            "ls" => self.cmd_ls(fs, out),
            "find" => self.cmd_find(args, fs, out),
            "create" => self.cmd_create(args, fs, out),
            "eye" => self.cmd_eye(args, fs, out),
            "trash" => self.cmd_trash(args, fs, out),
            "restore" => self.cmd_restore(args, fs, out),
            "erase" => self.cmd_erase(args, fs, out),
            "tag" => self.cmd_tag(args, fs, out),
            "untag" => self.cmd_untag(args, fs, out),
            "use" => self.cmd_use(args, fs, out),
            "info" => self.cmd_info(fs, out),
            "whoami" => self.cmd_whoami(out),
            "mem" => self.cmd_mem(out),
            "uptime" => self.cmd_uptime(out),
            "reboot" => {
                self.require_admin()?;
                Ok(ShellAction::Reboot)
            }
            "byebye" => {
                self.require_admin()?;
                let _ = writeln!(out, "so long");
                Ok(ShellAction::Shutdown)
            }
            _ => Err(ShellError::UnknownCommand),
        }
    }

    fn cmd_help(&self, out: &mut dyn Write) -> Result<ShellAction, ShellError> {
        let _ = writeln!(out, "commands:");
        let _ = writeln!(out, "  help | clear | info | whoami | mem | uptime");
        let _ = writeln!(out, "  login <user> <password>");
        let _ = writeln!(out, "  ls | find <key:value>...");
        let _ = writeln!(out, "  create <name> [--data <text>] [key:value]...");
        let _ = writeln!(out, "  eye <name>");
        let _ = writeln!(out, "  trash <name> | restore <name> | erase <name>");
        let _ = writeln!(out, "  tag <name> <key:value> | untag <name> <key>");
        let _ = writeln!(out, "  use <key:value>... | use clear");
        let _ = writeln!(out, "  reboot | byebye");
        Ok(ShellAction::None)
    }

    fn cmd_login(&mut self, args: &[&str], out: &mut dyn Write) -> Result<ShellAction, ShellError> {
        let [name, password] = args else {
            return Err(ShellError::BadArguments("login <user> <password>"));
        };
        let user = USERS
            .iter()
            .find(|u| u.name == *name && u.password == *password)
            .ok_or(ShellError::LoginFailed)?;
        self.user = Some(user);
        let _ = writeln!(out, "welcome, {}", user.name);
        Ok(ShellAction::None)
    }

    fn cmd_whoami(&self, out: &mut dyn Write) -> Result<ShellAction, ShellError> {
        let user = self.require_login()?;
        let _ = writeln!(
            out,
            "{}{}",
            user.name,
            if user.admin { " (admin)" } else { "" }
        );
        Ok(ShellAction::None)
    }

    fn cmd_ls<D: BlockDevice>(
        &self,
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        self.require_login()?;
        let ids = fs.list(&[], LIST_LIMIT);
        if ids.is_empty() {
            let _ = writeln!(out, "(empty)");
            return Ok(ShellAction::None);
        }
        for id in ids {
            let inode = fs.inode(id)?;
            let _ = write!(out, "{:>4}  {:<24} {:>8}B ", id, inode.name(), inode.size);
            for tag in inode.tags().iter().filter(|t| t.key() != TAG_NAME) {
                let _ = write!(out, " {}:{}", tag.key(), tag.value());
            }
            let _ = writeln!(out);
        }
        Ok(ShellAction::None)
    }

    /// Direct tag query, bypassing the context filter.
    fn cmd_find<D: BlockDevice>(
        &self,
        args: &[&str],
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        self.require_login()?;
        if args.is_empty() {
            return Err(ShellError::BadArguments("find <key:value>..."));
        }
        let mut predicate = Vec::with_capacity(args.len());
        for literal in args {
            predicate.push(Self::parse_tag(literal)?);
        }
        let ids = fs.query(&predicate, LIST_LIMIT);
        if ids.is_empty() {
            let _ = writeln!(out, "no matches");
            return Ok(ShellAction::None);
        }
        for id in ids {
            let inode = fs.inode(id)?;
            let _ = writeln!(out, "{:>4}  {}", id, inode.name());
        }
        Ok(ShellAction::None)
    }

    fn cmd_create<D: BlockDevice>(
        &self,
        args: &[&str],
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        let user = self.require_login()?;
        let usage = "create <name> [--data <text>] [key:value]...";
        let (&name, mut rest) = args.split_first().ok_or(ShellError::BadArguments(usage))?;

        let mut data: &str = "";
        let mut tags: Vec<Tag> = Vec::new();
        tags.push(Tag::new(TAG_NAME, name)?);
        tags.push(Tag::new(TAG_OWNER, user.name)?);

        while let Some((&token, remaining)) = rest.split_first() {
            rest = remaining;
            if token == "--data" {
                let (&text, remaining) = rest.split_first().ok_or(ShellError::BadArguments(usage))?;
                data = text;
                rest = remaining;
            } else {
                tags.push(Self::parse_tag(token)?);
            }
        }

        let id = fs.create(&tags, data.as_bytes())?;
        let _ = writeln!(out, "created {} (inode {})", name, id);
        Ok(ShellAction::None)
    }

    fn lookup<D: BlockDevice>(&self, fs: &TagFs<D>, name: &str) -> Result<u64, ShellError> {
        fs.find_by_name(name).ok_or(ShellError::NotFound)
    }

    fn cmd_eye<D: BlockDevice>(
        &self,
        args: &[&str],
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        self.require_login()?;
        let [name] = args else {
            return Err(ShellError::BadArguments("eye <name>"));
        };
        let id = self.lookup(fs, name)?;
        let content = fs.read_content(id)?;
        match core::str::from_utf8(&content) {
            Ok(text) => {
                let _ = writeln!(out, "{}", text);
            }
            Err(_) => {
                let _ = writeln!(out, "({} bytes of binary data)", content.len());
            }
        }
        Ok(ShellAction::None)
    }

    fn cmd_trash<D: BlockDevice>(
        &self,
        args: &[&str],
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        self.require_login()?;
        let [name] = args else {
            return Err(ShellError::BadArguments("trash <name>"));
        };
        let id = self.lookup(fs, name)?;
        fs.trash(id)?;
        let _ = writeln!(out, "trashed {}", name);
        Ok(ShellAction::None)
    }

    fn cmd_restore<D: BlockDevice>(
        &self,
        args: &[&str],
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        self.require_login()?;
        let [name] = args else {
            return Err(ShellError::BadArguments("restore <name>"));
        };
        let id = self.lookup(fs, name)?;
        fs.restore(id)?;
        let _ = writeln!(out, "restored {}", name);
        Ok(ShellAction::None)
    }

    fn cmd_erase<D: BlockDevice>(
        &self,
        args: &[&str],
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        self.require_admin()?;
        let [name] = args else {
            return Err(ShellError::BadArguments("erase <name>"));
        };
        let id = self.lookup(fs, name)?;
        fs.erase(id)?;
        let _ = writeln!(out, "erased {}", name);
        Ok(ShellAction::None)
    }

    fn cmd_tag<D: BlockDevice>(
        &self,
        args: &[&str],
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        self.require_login()?;
        let [name, literal] = args else {
            return Err(ShellError::BadArguments("tag <name> <key:value>"));
        };
        let id = self.lookup(fs, name)?;
        fs.add_tag(id, Self::parse_tag(literal)?)?;
        let _ = writeln!(out, "tagged {}", name);
        Ok(ShellAction::None)
    }

    fn cmd_untag<D: BlockDevice>(
        &self,
        args: &[&str],
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        self.require_login()?;
        let [name, key] = args else {
            return Err(ShellError::BadArguments("untag <name> <key>"));
        };
        let id = self.lookup(fs, name)?;
        fs.remove_tag(id, key)?;
        let _ = writeln!(out, "untagged {}", name);
        Ok(ShellAction::None)
    }

    fn cmd_use<D: BlockDevice>(
        &self,
        args: &[&str],
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        self.require_login()?;
        if matches!(args, ["clear"]) {
            fs.context_clear();
            let _ = writeln!(out, "context cleared");
            return Ok(ShellAction::None);
        }
        if args.is_empty() {
            if fs.context().is_empty() {
                let _ = writeln!(out, "context: (none)");
            } else {
                let _ = write!(out, "context:");
                for tag in fs.context() {
                    let _ = write!(out, " {}:{}", tag.key(), tag.value());
                }
                let _ = writeln!(out);
            }
            return Ok(ShellAction::None);
        }
        let mut tags = Vec::with_capacity(args.len());
        for literal in args {
            tags.push(Self::parse_tag(literal)?);
        }
        fs.context_set(&tags)?;
        let _ = writeln!(out, "context set ({} tag(s))", tags.len());
        Ok(ShellAction::None)
    }

    fn cmd_info<D: BlockDevice>(
        &self,
        fs: &mut TagFs<D>,
        out: &mut dyn Write,
    ) -> Result<ShellAction, ShellError> {
        self.require_login()?;
        let sb = fs.superblock();
        let _ = writeln!(out, "TagFS v{}", sb.version);
        let _ = writeln!(
            out,
            "  blocks: {}/{} free   inodes: {}/{} free",
            sb.free_blocks, sb.total_blocks, sb.free_inodes, sb.total_inodes
        );
        let _ = writeln!(
            out,
            "  layout: bitmap @{}  inodes @{}  data @{}",
            sb.bitmap_start, sb.inode_table_start, sb.data_region_start
        );
        Ok(ShellAction::None)
    }

    fn cmd_mem(&self, out: &mut dyn Write) -> Result<ShellAction, ShellError> {
        self.require_login()?;
        let stats = heap::mem_stats();
        let _ = writeln!(
            out,
            "heap: {}/{} bytes free, largest block {}, {} free block(s)",
            stats.free_bytes, stats.total_bytes, stats.largest_free_block, stats.free_blocks
        );
        Ok(ShellAction::None)
    }

    fn cmd_uptime(&self, out: &mut dyn Write) -> Result<ShellAction, ShellError> {
        self.require_login()?;
        let _ = writeln!(
            out,
            "up {} s ({} ticks)",
            pit::uptime_seconds(),
            pit::uptime_ticks()
        );
        Ok(ShellAction::None)
    }
}

/// The interactive shell task: prompt, line editing, dispatch, coloured
/// error reporting.
pub extern "C" fn shell_task(_arg: usize) {
    use crate::vga::{Color, ColorCode};
    use crate::{keyboard, print, println, tagfs, vga};

    let mut shell = Shell::new();
    println!("BoxOS shell; type help to get started, login to get anywhere.");

    loop {
        match shell.current_user() {
            Some(user) => print!("{}@box> ", user.name),
            None => print!("box> "),
        }

        let line = read_line();
        let mut output = String::new();
        let result = tagfs::with_fs(|fs| shell.execute(&line, fs, &mut output));
        match result {
            None => {
                vga::print_colored(
                    format_args!("error: filesystem not mounted\n"),
                    ColorCode::new(Color::LightRed, Color::Black),
                );
            }
            Some(Ok(action)) => {
                print!("{}", output);
                match action {
                    ShellAction::None => {}
                    ShellAction::ClearScreen => vga::WRITER.lock().clear_screen(),
                    ShellAction::Reboot => crate::arch::reboot(),
                    ShellAction::Shutdown => crate::arch::shutdown(),
                }
            }
            Some(Err(error)) => {
                print!("{}", output);
                vga::print_colored(
                    format_args!("error: {}\n", error),
                    ColorCode::new(Color::LightRed, Color::Black),
                );
            }
        }
        keyboard::flush();
    }
}

/// Read one line from the keyboard with echo and backspace handling.
fn read_line() -> String {
    use crate::{keyboard, print};

    let mut line = String::new();
    loop {
        let byte = keyboard::read_char_blocking();
        match byte {
            b'\n' => {
                print!("\n");
                return line;
            }
            0x08 => {
                if line.pop().is_some() {
                    print!("\x08");
                }
            }
            b'\t' => {
                // Tabs separate tokens just like spaces.
                line.push(' ');
                print!(" ");
            }
            byte if (0x20..0x7F).contains(&byte) => {
                line.push(byte as char);
                print!("{}", byte as char);
            }
            _ => {}
        }
    }
}
