use crate::{Error, Result};

/// A bounded, growable circular byte buffer.
///
/// The buffer owns a contiguous allocation of `capacity()` bytes (always a
/// multiple of 8) bounded by `[min, max]`, where `max == 0` means unbounded.
/// Data occupies `rpos .. (rpos + used) % capacity` and is exposed as at most
/// two linear ranges; free space likewise. The buffer is created at `min`
/// capacity, expands on demand in increments of at least `step` and can be
/// shrunk back down, keeping at least `min` plus a caller-chosen free margin.
///
/// `rpos == wpos` is ambiguous on its own: with `used == 0` the buffer is
/// empty, with `used == capacity` it is full. All range math goes through
/// `used` for this reason.
pub struct Circlebuf {
    buf: Vec<u8>,
    used: usize,
    max: usize,
    min: usize,
    step: usize,
    rpos: usize,
    wpos: usize,
}

fn align8(len: usize) -> usize {
    match len % 8 {
        0 => len,
        r => len + (8 - r),
    }
}

impl Circlebuf {
    /// Creates a buffer with initial capacity `min`, bounded by `max`
    /// (0 means unbounded), expanding and shrinking in steps of at least
    /// `step`. All three are rounded up to a multiple of 8.
    pub fn new(max: usize, min: usize, step: usize) -> Result<Circlebuf> {
        if min == 0 || step == 0 || (max > 0 && (min > max || step > max)) {
            return Err(Error::InvalidInput);
        }

        let max = if max > 0 { align8(max) } else { 0 };
        let min = align8(min);
        let step = align8(step);

        Ok(Circlebuf {
            buf: vec![0; min],
            used: 0,
            max,
            min,
            step,
            rpos: 0,
            wpos: 0,
        })
    }

    /// Current capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.used
    }

    /// Returns true if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Number of bytes that can be committed without expanding.
    pub fn freespace(&self) -> usize {
        self.buf.len() - self.used
    }

    /// The capacity bound, 0 meaning unbounded.
    pub fn max(&self) -> usize {
        self.max
    }

    /// The capacity floor.
    pub fn min(&self) -> usize {
        self.min
    }

    /// Grows the buffer until at least `freespace_need` bytes are free.
    ///
    /// Grows by at least `step`, rounds the new capacity up to a multiple of
    /// 8 and caps it at `max`. Fails with [`Error::LimitReached`] when the
    /// needed space cannot fit under `max`. When the live data wraps, the
    /// tail segment is relocated to the end of the new allocation so the
    /// logical byte order is preserved.
    pub fn expand(&mut self, freespace_need: usize) -> Result<()> {
        let size = self.buf.len();
        if size - self.used >= freespace_need {
            return Ok(());
        }

        if self.max > 0 && self.used + freespace_need > self.max {
            return Err(Error::LimitReached);
        }

        let mut new_size = self.used + freespace_need;
        if new_size - size < self.step {
            new_size = size + self.step;
        }
        new_size = align8(new_size);
        if self.max > 0 && new_size > self.max {
            new_size = self.max;
        }

        self.buf.resize(new_size, 0);

        // Wrapped (or full) data: keep the tail at the end of the buffer.
        if self.wpos < self.rpos || (self.wpos == self.rpos && self.used > 0) {
            let tail = size - self.rpos;
            self.buf.copy_within(self.rpos..size, new_size - tail);
            self.rpos += new_size - size;
        }

        Ok(())
    }

    /// Shrinks the capacity to `used + freespace_keep` (8-aligned).
    ///
    /// Never shrinks below `min`; refuses (fails with
    /// [`Error::LimitReached`]) when that floor cannot hold the requested
    /// margin, and silently keeps the current capacity when the saving would
    /// be smaller than `step`. Live data is relocated so it fits the new
    /// bound with its order preserved.
    pub fn shrink(&mut self, freespace_keep: usize) -> Result<()> {
        let size = self.buf.len();
        if size - self.used <= freespace_keep {
            return Ok(());
        }

        if self.used + freespace_keep < self.min {
            return Err(Error::LimitReached);
        }

        let mut new_size = self.used + freespace_keep;
        if size - new_size < self.step {
            // Too small a saving to bother.
            return Ok(());
        }
        new_size = align8(new_size);
        if self.max > 0 && new_size > self.max {
            new_size = self.max;
        }
        if new_size >= size {
            return Ok(());
        }

        if self.rpos < self.wpos {
            // Contiguous data; pull whatever would straddle the new bound
            // back to the front.
            if new_size <= self.rpos {
                self.buf.copy_within(self.rpos..self.rpos + self.used, 0);
                self.rpos = 0;
                self.wpos = self.used;
            } else if new_size > self.rpos && new_size < self.wpos {
                self.buf.copy_within(new_size..self.wpos, 0);
                self.wpos -= new_size;
            } else if new_size == self.wpos {
                self.wpos = 0;
            }
        } else if self.wpos < self.rpos {
            // Wrapped data; slide the tail left to end at the new bound.
            let cut = size - new_size;
            self.buf.copy_within(self.rpos..size, self.rpos - cut);
            self.rpos -= cut;
        } else {
            // rpos == wpos with used > 0 would be a full buffer, which the
            // freespace check above already sent home.
            self.rpos = 0;
            self.wpos = 0;
        }

        self.buf.truncate(new_size);
        self.buf.shrink_to_fit();

        Ok(())
    }

    /// Drops all buffered data and resets the offsets.
    pub fn erase_all(&mut self) {
        self.used = 0;
        self.rpos = 0;
        self.wpos = 0;
    }

    /// Advances the read position by `len`, discarding that many bytes.
    pub fn erase(&mut self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(Error::InvalidInput);
        }
        if len > self.used {
            return Err(Error::OutOfRange);
        }

        self.used -= len;
        self.rpos = (self.rpos + len) % self.buf.len();
        Ok(())
    }

    /// Advances the write position by `len`, claiming bytes previously
    /// filled in through [`freespace_slices_mut`].
    ///
    /// [`freespace_slices_mut`]: Circlebuf::freespace_slices_mut
    pub fn commit(&mut self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(Error::InvalidInput);
        }
        if len > self.buf.len() - self.used {
            return Err(Error::OutOfRange);
        }

        self.used += len;
        self.wpos = (self.wpos + len) % self.buf.len();
        Ok(())
    }

    /// Appends `data`, expanding the buffer if needed.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidInput);
        }

        if self.buf.len() - self.used < data.len() {
            self.expand(data.len())?;
        }
        let size = self.buf.len();

        if self.rpos < self.wpos {
            let tail = size - self.wpos;
            if tail >= data.len() {
                self.buf[self.wpos..self.wpos + data.len()].copy_from_slice(data);
            } else {
                self.buf[self.wpos..size].copy_from_slice(&data[..tail]);
                self.buf[..data.len() - tail].copy_from_slice(&data[tail..]);
            }
        } else if self.wpos < self.rpos {
            self.buf[self.wpos..self.wpos + data.len()].copy_from_slice(data);
        } else {
            // Empty (a full buffer cannot reach here once expanded).
            self.rpos = 0;
            self.wpos = 0;
            self.buf[..data.len()].copy_from_slice(data);
        }

        self.used += data.len();
        self.wpos = (self.wpos + data.len()) % size;
        Ok(())
    }

    /// The buffered data as at most two linear ranges, in logical order.
    pub fn data_slices(&self) -> (&[u8], &[u8]) {
        let size = self.buf.len();

        if self.rpos < self.wpos {
            (&self.buf[self.rpos..self.wpos], &[])
        } else if self.wpos < self.rpos || self.used > 0 {
            // Wrapped or full.
            (&self.buf[self.rpos..size], &self.buf[..self.wpos])
        } else {
            (&[], &[])
        }
    }

    /// The free space as at most two linear ranges.
    ///
    /// When the buffer is empty the offsets are reset to 0 first, so the
    /// whole capacity is returned as one contiguous range.
    pub fn freespace_slices_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let size = self.buf.len();

        if self.used == 0 {
            self.rpos = 0;
            self.wpos = 0;
            return (&mut self.buf[..], &mut []);
        }
        if self.used == size {
            return (&mut [], &mut []);
        }

        if self.rpos < self.wpos {
            let (head, tail) = self.buf.split_at_mut(self.wpos);
            (tail, &mut head[..self.rpos])
        } else {
            // self.wpos < self.rpos; the gap is one contiguous range.
            (&mut self.buf[self.wpos..self.rpos], &mut [])
        }
    }

    /// Copies exactly `out.len()` bytes out of the buffer and consumes them.
    ///
    /// Fails with [`Error::NoData`] when fewer bytes are buffered.
    pub fn get(&mut self, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Err(Error::InvalidInput);
        }
        if out.len() > self.used {
            return Err(Error::NoData);
        }
        let size = self.buf.len();
        let len = out.len();

        if self.rpos < self.wpos {
            out.copy_from_slice(&self.buf[self.rpos..self.rpos + len]);
        } else {
            // Wrapped or full.
            let tail = size - self.rpos;
            if len <= tail {
                out.copy_from_slice(&self.buf[self.rpos..self.rpos + len]);
            } else {
                out[..tail].copy_from_slice(&self.buf[self.rpos..size]);
                out[tail..].copy_from_slice(&self.buf[..len - tail]);
            }
        }

        self.used -= len;
        self.rpos = (self.rpos + len) % size;
        Ok(())
    }

    /// Extracts at most one message ending with `ending` into `out`,
    /// returning the message length (delimiter included).
    ///
    /// The earliest occurrence wins, even when it straddles the wrap
    /// boundary. Fails with [`Error::NoData`] when fewer than
    /// `ending.len()` bytes are buffered, [`Error::NotFound`] when no
    /// occurrence exists and [`Error::BufferTooSmall`] when `out` cannot
    /// hold the message.
    pub fn get_by_ending(&mut self, ending: &[u8], out: &mut [u8]) -> Result<usize> {
        if ending.is_empty() || out.is_empty() || ending.len() > out.len() {
            return Err(Error::InvalidInput);
        }
        if ending.len() > self.used {
            return Err(Error::NoData);
        }
        let size = self.buf.len();

        if self.rpos < self.wpos {
            // Contiguous data.
            let data = &self.buf[self.rpos..self.rpos + self.used];
            match find(data, ending) {
                Some(pos) => {
                    let ret = pos + ending.len();
                    if ret > out.len() {
                        return Err(Error::BufferTooSmall);
                    }
                    out[..ret].copy_from_slice(&data[..ret]);
                    self.used -= ret;
                    self.rpos += ret;
                    Ok(ret)
                }
                None => Err(Error::NotFound),
            }
        } else {
            // Wrapped or full. 1: the contiguous run from rpos to the end.
            let tail_len = size - self.rpos;
            if tail_len >= ending.len() {
                if let Some(pos) = find(&self.buf[self.rpos..size], ending) {
                    let ret = pos + ending.len();
                    if ret > out.len() {
                        return Err(Error::BufferTooSmall);
                    }
                    out[..ret].copy_from_slice(&self.buf[self.rpos..self.rpos + ret]);
                    self.used -= ret;
                    self.rpos = (self.rpos + ret) % size;
                    return Ok(ret);
                }
            }

            // 2: every alignment that straddles the wrap boundary.
            if self.wpos > 0 && ending.len() > 1 {
                let mut start = size - (ending.len() - 1);
                if start < self.rpos {
                    start = self.rpos;
                }
                let end = ending.len().min(self.wpos + 1) - 1;
                let search_len = (size - start) + end;
                let search_count = (search_len + 1).saturating_sub(ending.len());

                'next: for i in 0..search_count {
                    let tail = size - (start + i);
                    let head = ending.len() - tail;
                    if self.buf[start + i..size] != ending[..tail] {
                        continue 'next;
                    }
                    if self.buf[..head] != ending[tail..] {
                        continue 'next;
                    }

                    let ret = (size - self.rpos) + head;
                    if ret > out.len() {
                        return Err(Error::BufferTooSmall);
                    }
                    out[..size - self.rpos].copy_from_slice(&self.buf[self.rpos..size]);
                    out[size - self.rpos..ret].copy_from_slice(&self.buf[..head]);
                    self.used -= ret;
                    self.rpos = (self.rpos + ret) % size;
                    return Ok(ret);
                }
            }

            // 3: the run from the front of the buffer to wpos.
            if self.wpos >= ending.len() {
                if let Some(pos) = find(&self.buf[..self.wpos], ending) {
                    let head = pos + ending.len();
                    let ret = (size - self.rpos) + head;
                    if ret > out.len() {
                        return Err(Error::BufferTooSmall);
                    }
                    out[..size - self.rpos].copy_from_slice(&self.buf[self.rpos..size]);
                    out[size - self.rpos..ret].copy_from_slice(&self.buf[..head]);
                    self.used -= ret;
                    self.rpos = (self.rpos + ret) % size;
                    return Ok(ret);
                }
            }

            Err(Error::NotFound)
        }
    }
}

impl std::fmt::Debug for Circlebuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circlebuf")
            .field("size", &self.buf.len())
            .field("used", &self.used)
            .field("max", &self.max)
            .field("min", &self.min)
            .field("step", &self.step)
            .field("rpos", &self.rpos)
            .field("wpos", &self.wpos)
            .finish()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
