/// Hardware end-stop state of one axis, as of the last status poll.
///
/// `Lower` is the left/negative switch, `Upper` the right/positive one.
/// Some stages wire their switches active-low; `from_flags` applies the
/// per-axis polarity inversion before classifying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitSwitches {
    #[default]
    None,
    Upper,
    Lower,
    Both,
}

impl LimitSwitches {
    pub fn from_flags(left: bool, right: bool, invert: bool) -> Self {
        let (lower, upper) = if invert { (!left, !right) } else { (left, right) };
        match (lower, upper) {
            (false, false) => LimitSwitches::None,
            (false, true) => LimitSwitches::Upper,
            (true, false) => LimitSwitches::Lower,
            (true, true) => LimitSwitches::Both,
        }
    }

    pub fn has_upper(&self) -> bool {
        matches!(self, LimitSwitches::Upper | LimitSwitches::Both)
    }

    pub fn has_lower(&self) -> bool {
        matches!(self, LimitSwitches::Lower | LimitSwitches::Both)
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, LimitSwitches::None)
    }

    pub fn any_active(&self) -> bool {
        !self.is_clear()
    }
}
