//! Sparse virtual register space served by the RBCP server.
//!
//! A [`Region`] is one contiguous address window with its own backing bytes
//! and optional per-byte access hooks; a [`RegisterBank`] is an ordered
//! collection of regions plus the device-reserved window at 0xFFFF0000. An
//! access is serviced by the first region that fully contains its range, so
//! a bank behaves like a sparse 32-bit memory with holes that answer with
//! bus errors.
//!
//! Banks can be populated from files in three formats (selected by file
//! name, see [`RegisterBank::load_file`]) and regions that touch or overlap
//! can be coalesced with [`RegisterBank::merge_all`].

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Callback fired for every byte covered by a read access.
pub type ReadHook = Box<dyn Fn(u32) + Send + Sync>;
/// Callback fired for every byte covered by a write access, with the value
/// being written to that byte.
pub type WriteHook = Box<dyn Fn(u32, u8) + Send + Sync>;

/// Base address of the reserved register window every device carries.
pub const RESERVED_BASE: u32 = 0xFFFF_0000;
/// Size of the reserved register window in bytes.
pub const RESERVED_SIZE: usize = 65536;

/// Maximum number of bytes loaded from a single binary image file.
const BINARY_IMAGE_LIMIT: u64 = 65536;

/// One contiguous register window.
pub struct Region {
    start: u32,
    memory: Vec<u8>,
    read_hooks: HashMap<u32, ReadHook>,
    write_hooks: HashMap<u32, WriteHook>,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Region {:08X}-{:08X}: {} bytes",
            self.start,
            self.end().saturating_sub(1),
            self.memory.len()
        )
    }
}

impl Region {
    /// Creates a zero-filled region of `size` bytes starting at `start`.
    pub fn new(size: usize, start: u32) -> Region {
        Region {
            start,
            memory: vec![0; size],
            read_hooks: HashMap::new(),
            write_hooks: HashMap::new(),
        }
    }

    /// Creates a region whose content is `data`, starting at `start`.
    pub fn from_initial_data(start: u32, data: Vec<u8>) -> Region {
        Region { start, memory: data, read_hooks: HashMap::new(), write_hooks: HashMap::new() }
    }

    /// First byte address of the region.
    pub fn start_address(&self) -> u32 {
        self.start
    }

    /// One past the last byte address. 64-bit because a region may end
    /// exactly at the top of the 32-bit address space.
    pub fn end(&self) -> u64 {
        self.start as u64 + self.memory.len() as u64
    }

    /// Region size in bytes.
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    /// Returns whether `[address, address + length)` lies entirely inside
    /// this region.
    pub fn contains(&self, address: u32, length: usize) -> bool {
        address as u64 >= self.start as u64 && address as u64 + length as u64 <= self.end()
    }

    /// Installs a read hook for one byte address. Ignored when the address
    /// is outside the region.
    pub fn set_read_hook(&mut self, address: u32, hook: ReadHook) {
        if self.contains(address, 1) {
            self.read_hooks.insert(address, hook);
        }
    }

    /// Installs a write hook for one byte address. Ignored when the address
    /// is outside the region.
    pub fn set_write_hook(&mut self, address: u32, hook: WriteHook) {
        if self.contains(address, 1) {
            self.write_hooks.insert(address, hook);
        }
    }

    /// Reads `length` bytes starting at `address`, firing the read hook of
    /// every covered byte first.
    pub fn read(&self, address: u32, length: usize) -> Result<Vec<u8>> {
        if !self.contains(address, length) {
            return Err(Error::OutOfRange { address, length });
        }
        for index in 0..length {
            let byte_address = address + index as u32;
            if let Some(hook) = self.read_hooks.get(&byte_address) {
                hook(byte_address);
            }
        }
        let offset = (address - self.start) as usize;
        Ok(self.memory[offset..offset + length].to_vec())
    }

    /// Writes `data` starting at `address`. The write hook of every covered
    /// byte fires with the value being written there, before the commit.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if !self.contains(address, data.len()) {
            return Err(Error::OutOfRange { address, length: data.len() });
        }
        for (index, &value) in data.iter().enumerate() {
            let byte_address = address + index as u32;
            if let Some(hook) = self.write_hooks.get(&byte_address) {
                hook(byte_address, value);
            }
        }
        let offset = (address - self.start) as usize;
        self.memory[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Returns whether the two regions share at least one byte address.
    fn intersects(&self, other: &Region) -> bool {
        (self.start as u64) < other.end() && (other.start as u64) < self.end()
    }

    /// Returns whether the two regions touch without overlapping.
    fn is_adjacent(&self, other: &Region) -> bool {
        self.end() == other.start as u64 || other.end() == self.start as u64
    }

    /// Coalesces two regions into one spanning both. `second`'s bytes win
    /// where the regions overlap, and so do its hooks.
    fn merged(first: Region, second: Region) -> Region {
        let start = first.start.min(second.start);
        let end = first.end().max(second.end());
        debug!("register regions merged: {:?} with {:?}", first, second);

        let mut memory = vec![0u8; (end - start as u64) as usize];
        let offset = (first.start - start) as usize;
        memory[offset..offset + first.memory.len()].copy_from_slice(&first.memory);
        let offset = (second.start - start) as usize;
        memory[offset..offset + second.memory.len()].copy_from_slice(&second.memory);

        let mut read_hooks = first.read_hooks;
        read_hooks.extend(second.read_hooks);
        let mut write_hooks = first.write_hooks;
        write_hooks.extend(second.write_hooks);

        info!("register regions merged: start {:08X} size {} bytes", start, memory.len());
        Region { start, memory, read_hooks, write_hooks }
    }

    /// Hexdump of the region, 16 bytes per line, `ADDRESS:XX XX ..` format.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (row, chunk) in self.memory.chunks(16).enumerate() {
            let mut line = format!("{:08X}:", self.start as u64 + row as u64 * 16);
            for byte in chunk {
                line.push_str(&format!("{byte:02X} "));
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out
    }
}

/// Ordered collection of regions forming the register space of one device.
///
/// A freshly created bank carries the reserved window
/// `[0xFFFF0000, 0xFFFF0000 + 65536)` that real devices always answer on.
pub struct RegisterBank {
    regions: Vec<Region>,
}

impl Default for RegisterBank {
    fn default() -> Self {
        RegisterBank::new()
    }
}

impl RegisterBank {
    /// Creates a bank holding only the reserved register window.
    pub fn new() -> RegisterBank {
        RegisterBank { regions: vec![Region::new(RESERVED_SIZE, RESERVED_BASE)] }
    }

    /// Appends a region. Later regions cannot shadow earlier ones: address
    /// resolution picks the first region that contains the whole range.
    pub fn push_region(&mut self, region: Region) {
        self.regions.push(region);
    }

    /// The regions of the bank, in resolution order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Installs a read hook on the first region containing `address`.
    /// Returns whether a region accepted it.
    pub fn set_read_hook(&mut self, address: u32, hook: ReadHook) -> bool {
        for region in &mut self.regions {
            if region.contains(address, 1) {
                region.set_read_hook(address, hook);
                return true;
            }
        }
        false
    }

    /// Installs a write hook on the first region containing `address`.
    /// Returns whether a region accepted it.
    pub fn set_write_hook(&mut self, address: u32, hook: WriteHook) -> bool {
        for region in &mut self.regions {
            if region.contains(address, 1) {
                region.set_write_hook(address, hook);
                return true;
            }
        }
        false
    }

    /// Reads from the first region containing the whole range.
    pub fn read(&self, address: u32, length: usize) -> Result<Vec<u8>> {
        for region in &self.regions {
            if region.contains(address, length) {
                return region.read(address, length);
            }
        }
        Err(Error::OutOfRange { address, length })
    }

    /// Writes to the first region containing the whole range and returns the
    /// read-back bytes after the commit.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<Vec<u8>> {
        for region in &mut self.regions {
            if region.contains(address, data.len()) {
                region.write(address, data)?;
                return region.read(address, data.len());
            }
        }
        Err(Error::OutOfRange { address, length: data.len() })
    }

    /// Loads initial register content from a file and appends one region per
    /// address area found. Returns the `(address, length)` list of the
    /// loaded areas.
    ///
    /// The content format is selected by the file name:
    ///
    /// - `<hexaddr>.bin`: raw binary image loaded at the address encoded in
    ///   the file stem, capped at 64 KiB
    /// - `<hexaddr>.<other>`: whitespace-separated hex bytes, `#` starts a
    ///   line comment, concatenated across lines
    /// - anything else: address-prefixed text, each non-comment line being
    ///   `<hexaddr>: <hexbyte> <hexbyte> ..`; lines sharing an address append
    pub fn load_file(&mut self, path: &Path) -> Result<Vec<(u32, usize)>> {
        let areas = parse_initial_file(path)?;
        let mut loaded = Vec::with_capacity(areas.len());
        for (address, data) in areas {
            loaded.push((address, data.len()));
            self.regions.push(Region::from_initial_data(address, data));
        }
        Ok(loaded)
    }

    /// Applies [`RegisterBank::load_file`] to every file in a directory.
    pub fn load_dir(&mut self, path: &Path) -> Result<Vec<(u32, usize)>> {
        let mut entries: Vec<fs::DirEntry> =
            fs::read_dir(path)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        let mut loaded = Vec::new();
        for entry in entries {
            loaded.extend(self.load_file(&entry.path())?);
        }
        Ok(loaded)
    }

    /// Coalesces regions until no two regions overlap or touch.
    ///
    /// When two regions merge, the later one's bytes win on overlap. The
    /// operation is idempotent and terminates because every merge reduces
    /// the region count by one.
    pub fn merge_all(&mut self) {
        loop {
            let mut pair = None;
            'outer: for first in 0..self.regions.len() {
                for second in first + 1..self.regions.len() {
                    let (a, b) = (&self.regions[first], &self.regions[second]);
                    if a.intersects(b) || a.is_adjacent(b) {
                        pair = Some((first, second));
                        break 'outer;
                    }
                }
            }
            let Some((first, second)) = pair else { break };
            let late = self.regions.remove(second);
            let early = self.regions.remove(first);
            self.regions.insert(first, Region::merged(early, late));
        }
    }

    /// Hexdump of every region in resolution order.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for region in &self.regions {
            out.push_str(&region.dump());
        }
        out
    }

    /// `(start, end, size)` of every region, in resolution order.
    pub fn region_info(&self) -> Vec<(u32, u64, usize)> {
        self.regions
            .iter()
            .map(|region| (region.start_address(), region.end(), region.size()))
            .collect()
    }
}

/// Parses an initial content file into `(address, bytes)` areas, format
/// selected by file name as documented on [`RegisterBank::load_file`].
fn parse_initial_file(path: &Path) -> Result<Vec<(u32, Vec<u8>)>> {
    let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or("");
    let stem_address = u32::from_str_radix(stem, 16).ok();
    let extension = path.extension().and_then(|ext| ext.to_str());

    if extension == Some("bin") {
        let address = stem_address.ok_or_else(|| {
            Error::InvalidArgument(format!(
                "binary image name must be a hex address: {}",
                path.display()
            ))
        })?;
        let mut data = Vec::new();
        fs::File::open(path)?.take(BINARY_IMAGE_LIMIT).read_to_end(&mut data)?;
        return Ok(vec![(address, data)]);
    }

    let text = fs::read_to_string(path)?;
    match stem_address {
        Some(address) => Ok(vec![(address, parse_hex_lines(&text, path))]),
        None => Ok(parse_addressed_lines(&text, path)),
    }
}

/// Whitespace-separated hex bytes, `#` comments, concatenated across lines.
fn parse_hex_lines(text: &str, path: &Path) -> Vec<u8> {
    let mut data = Vec::new();
    for line in text.lines() {
        let payload = line.split('#').next().unwrap_or("");
        for token in payload.split_whitespace() {
            match u8::from_str_radix(token, 16) {
                Ok(byte) => data.push(byte),
                Err(err) => {
                    warn!("bad hex byte {:?} in {}: {}", token, path.display(), err);
                    break;
                }
            }
        }
    }
    data
}

/// Address-prefixed text: `<hexaddr>: <hexbyte> ..` per line, repeated
/// addresses append. Returns areas in first-seen order.
fn parse_addressed_lines(text: &str, path: &Path) -> Vec<(u32, Vec<u8>)> {
    let mut areas: Vec<(u32, Vec<u8>)> = Vec::new();
    for line in text.lines() {
        let payload = line.split('#').next().unwrap_or("").trim();
        if payload.is_empty() {
            continue;
        }
        let Some((address_text, bytes_text)) = payload.split_once(':') else {
            continue;
        };
        let address = match u32::from_str_radix(address_text.trim(), 16) {
            Ok(address) => address,
            Err(err) => {
                warn!("bad address {:?} in {}: {}", address_text, path.display(), err);
                continue;
            }
        };
        let index = match areas.iter().position(|(existing, _)| *existing == address) {
            Some(index) => index,
            None => {
                areas.push((address, Vec::new()));
                areas.len() - 1
            }
        };
        let area = &mut areas[index].1;
        for token in bytes_text.split_whitespace() {
            match u8::from_str_radix(token, 16) {
                Ok(byte) => area.push(byte),
                Err(err) => {
                    warn!("bad hex byte {:?} in {}: {}", token, path.display(), err);
                    break;
                }
            }
        }
    }
    areas
}
