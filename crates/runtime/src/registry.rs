use crate::{error::ErrorKind, Error, MValue, Result};

/// The register stack for one thread
///
/// Call frames borrow contiguous windows of the registry, and the explicit top
/// marker is how multiple return values flow between producers and consumers.
/// Slots above the top read as nil. Growth is bounded; exceeding the limit is a
/// runtime error rather than unbounded allocation.
pub(crate) struct Registry {
    values: Vec<MValue>,
    top: usize,
    max_size: usize,
    grow_step: usize,
}

impl Registry {
    pub fn new(initial_size: usize, max_size: usize, grow_step: usize) -> Self {
        Self {
            values: vec![MValue::Nil; initial_size.min(max_size)],
            top: 0,
            max_size,
            grow_step,
        }
    }

    fn ensure(&mut self, required: usize) -> Result<()> {
        if required > self.values.len() {
            if required > self.max_size {
                return Err(Error::from(ErrorKind::RegistryOverflow));
            }
            let mut new_size = self.values.len().max(self.grow_step);
            while new_size < required {
                new_size += self.grow_step;
            }
            self.values.resize(new_size.min(self.max_size), MValue::Nil);
        }
        Ok(())
    }

    pub fn top(&self) -> usize {
        self.top
    }

    /// Moves the top marker, clearing slots that fall in or out of scope
    pub fn set_top(&mut self, top: usize) -> Result<()> {
        self.ensure(top)?;
        if top < self.top {
            for value in &mut self.values[top..self.top] {
                *value = MValue::Nil;
            }
        }
        self.top = top;
        Ok(())
    }

    /// The value at the given index, nil above the top
    pub fn get(&self, index: usize) -> MValue {
        if index < self.top {
            self.values[index].clone()
        } else {
            MValue::Nil
        }
    }

    /// Reads a slot directly, ignoring the top marker
    ///
    /// Open upvalues read through here, since their slots can sit above the top
    /// of a suspended frame.
    pub fn get_any(&self, index: usize) -> MValue {
        self.values.get(index).cloned().unwrap_or_default()
    }

    /// Writes a slot directly, ignoring the top marker
    pub fn set_any(&mut self, index: usize, value: MValue) {
        if index < self.values.len() {
            self.values[index] = value;
        }
    }

    pub fn set(&mut self, index: usize, value: MValue) -> Result<()> {
        self.ensure(index + 1)?;
        self.values[index] = value;
        if index >= self.top {
            self.top = index + 1;
        }
        Ok(())
    }

    pub fn push(&mut self, value: MValue) -> Result<()> {
        let top = self.top;
        self.set(top, value)
    }

    pub fn pop(&mut self) -> MValue {
        if self.top == 0 {
            return MValue::Nil;
        }
        self.top -= 1;
        std::mem::take(&mut self.values[self.top])
    }

    /// Inserts a value at the given index, shifting everything above it up
    pub fn insert(&mut self, value: MValue, index: usize) -> Result<()> {
        self.push(value)?;
        self.values[index..self.top].rotate_right(1);
        Ok(())
    }

    /// Clones the values in `[from, to)`, clamped to the top
    pub fn slice(&self, from: usize, to: usize) -> Vec<MValue> {
        let to = to.min(self.top);
        if from >= to {
            return Vec::new();
        }
        self.values[from..to].to_vec()
    }

    /// Copies `count` values from `src` to `dst` within the registry
    pub fn move_range(&mut self, src: usize, dst: usize, count: usize) -> Result<()> {
        self.ensure(dst + count)?;
        if dst <= src {
            for i in 0..count {
                self.values[dst + i] = self.values[src + i].clone();
            }
        } else {
            for i in (0..count).rev() {
                self.values[dst + i] = self.values[src + i].clone();
            }
        }
        if dst + count > self.top {
            self.top = dst + count;
        }
        Ok(())
    }

    /// Fills `count` slots starting at `from` with nil
    pub fn fill_nil(&mut self, from: usize, count: usize) -> Result<()> {
        self.ensure(from + count)?;
        for i in from..from + count {
            self.values[i] = MValue::Nil;
        }
        if from + count > self.top {
            self.top = from + count;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(8, 64, 8)
    }

    #[test]
    fn top_tracks_writes() {
        let mut r = registry();
        r.set(3, MValue::Number(1.0)).unwrap();
        assert_eq!(r.top(), 4);
        assert_eq!(r.get(3), MValue::Number(1.0));
        assert_eq!(r.get(2), MValue::Nil);
        assert_eq!(r.get(10), MValue::Nil);
    }

    #[test]
    fn lowering_the_top_clears_slots() {
        let mut r = registry();
        r.push(MValue::Number(1.0)).unwrap();
        r.push(MValue::Number(2.0)).unwrap();
        r.set_top(0).unwrap();
        r.set_top(2).unwrap();
        assert_eq!(r.get(0), MValue::Nil);
        assert_eq!(r.get(1), MValue::Nil);
    }

    #[test]
    fn growth_is_bounded() {
        let mut r = Registry::new(8, 16, 8);
        assert!(r.set(15, MValue::Bool(true)).is_ok());
        assert!(r.set(16, MValue::Bool(true)).is_err());
    }

    #[test]
    fn insert_shifts_upwards() {
        let mut r = registry();
        r.push(MValue::Number(1.0)).unwrap();
        r.push(MValue::Number(2.0)).unwrap();
        r.insert(MValue::Number(9.0), 1).unwrap();
        assert_eq!(r.get(0), MValue::Number(1.0));
        assert_eq!(r.get(1), MValue::Number(9.0));
        assert_eq!(r.get(2), MValue::Number(2.0));
    }

    #[test]
    fn move_range_handles_overlap() {
        let mut r = registry();
        for i in 0..4 {
            r.push(MValue::Number(i as f64)).unwrap();
        }
        r.move_range(1, 0, 3).unwrap();
        assert_eq!(r.get(0), MValue::Number(1.0));
        assert_eq!(r.get(2), MValue::Number(3.0));
    }
}
