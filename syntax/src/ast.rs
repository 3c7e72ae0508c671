/// type alias just to make type signatures look more consistent.
pub type Ident<'a> = &'a str;

/// The right-hand side of an option or global assignment.
#[derive(Debug, PartialEq, Eq)]
pub enum Rhs<'a> {
    /// no rhs (e.g. a bare flag like `autoprovides`)
    Unbound,
    /// "some quoted value" or unquoted_value_without_spaces
    Literal { val: &'a str },
    /// $var
    Variable { name: Ident<'a> },
    /// "foo-$bla-blee"
    Interp { text: &'a str, vars: Vec<Ident<'a>> },
}

// These methods are just to assist with writing more legible tests.
#[cfg(test)]
impl<'a> Rhs<'a> {
    pub fn literal(val: &'a str) -> Self {
        Self::Literal { val }
    }
    pub fn variable(name: &'a str) -> Self {
        Self::Variable { name }
    }
}

/// A reference to a target in a step header.
#[derive(Debug, PartialEq, Eq)]
pub enum TargetRef<'a> {
    /// "path/to/file" or path/to/file; `vars` are `$var`s to interpolate.
    File { text: &'a str, vars: Vec<Ident<'a>> },
    /// @step_name
    Step(Ident<'a>),
    /// $variable
    Var(Ident<'a>),
    /// `?`: the set is computed by the step body.
    Undetermined,
}

#[cfg(test)]
impl<'a> TargetRef<'a> {
    pub fn file(text: &'a str) -> Self {
        Self::File {
            text,
            vars: Vec::with_capacity(0),
        }
    }
}

/// One part of the header of a [`StepBlock`].
#[derive(Debug, PartialEq, Eq)]
pub enum BlockSpec<'a> {
    /// `< target...`
    Input(Vec<TargetRef<'a>>),
    /// `> target...`
    Output(Vec<TargetRef<'a>>),
    /// `^ target...`
    Depends(Vec<TargetRef<'a>>),
    /// `:: key=value`
    Option { key: Ident<'a>, rhs: Rhs<'a> },
}

/// A `step` block.
#[derive(Debug, PartialEq, Eq)]
pub struct StepBlock<'a> {
    /// Step name, e.g. `align_10`
    pub name: Ident<'a>,
    /// Header components
    pub specs: Vec<BlockSpec<'a>>,
    /// Shell code contained within braces
    pub code: BashCode<'a>,
}

/// A block of bash code.
#[derive(Debug, PartialEq, Eq)]
pub struct BashCode<'a> {
    /// The literal text of the code.
    pub text: &'a str,
    /// Set of variable names referenced in the code.
    pub vars: crate::HashSet<Ident<'a>>,
}

/// One high-level item in the script.
#[derive(Debug, PartialEq, Eq)]
pub enum Item<'a> {
    /// A step definition.
    Step(StepBlock<'a>),
    /// A block of global variables.
    GlobalConfig(Vec<(Ident<'a>, Rhs<'a>)>),
}
