use std::ops::Range;

/// A named parameter tensor living inside the model's flat parameter buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub range: Range<usize>,
}

/// Describes how a flat `[f32]` parameter buffer is split into named tensors.
///
/// The gradient buffer of a model shares the same layout, so optimizers,
/// clipping and all-reduce work on plain slices while checkpoints still get
/// one tensor per parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamLayout {
    entries: Vec<ParamEntry>,
    size: usize,
}

impl ParamLayout {
    /// Creates an empty `ParamLayout`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves space for a new tensor right after the last one.
    ///
    /// # Arguments
    /// * `name` - The tensor's unique name.
    /// * `shape` - The tensor's dimensions.
    ///
    /// # Returns
    /// The range of the flat buffer that belongs to the tensor.
    pub fn push(&mut self, name: impl Into<String>, shape: &[usize]) -> Range<usize> {
        let len = shape.iter().product::<usize>();
        let range = self.size..self.size + len;
        self.size += len;

        self.entries.push(ParamEntry {
            name: name.into(),
            shape: shape.to_vec(),
            range: range.clone(),
        });

        range
    }

    /// The total amount of parameters.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ParamEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}
