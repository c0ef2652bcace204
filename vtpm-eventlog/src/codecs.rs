// SPDX-FileCopyrightText: © 2025 vtpm-verify contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed vector codec for the non-compact integers used by the
//! TCG firmware log structures.

use core::marker::PhantomData;
use scale::{Decode, Encode, Error, Input, Output};

/// A `Vec<T>` encoded with a fixed-width `Len` prefix instead of a SCALE
/// compact length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VecOf<Len, T> {
    items: Vec<T>,
    _len: PhantomData<Len>,
}

impl<Len, T> VecOf<Len, T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            _len: PhantomData,
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn into_inner(self) -> Vec<T> {
        self.items
    }
}

impl<Len, T> Default for VecOf<Len, T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<Len, T> From<Vec<T>> for VecOf<Len, T> {
    fn from(items: Vec<T>) -> Self {
        Self::new(items)
    }
}

impl<Len, T> From<VecOf<Len, T>> for Vec<T> {
    fn from(value: VecOf<Len, T>) -> Self {
        value.items
    }
}

impl<Len, T> core::ops::Deref for VecOf<Len, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<Len, T> Decode for VecOf<Len, T>
where
    Len: Decode + TryInto<usize>,
    T: Decode,
{
    fn decode<I: Input>(input: &mut I) -> Result<Self, Error> {
        let len = Len::decode(input)?;
        let len: usize = len
            .try_into()
            .map_err(|_| Error::from("invalid length prefix"))?;
        let mut items = Vec::new();
        for _ in 0..len {
            items.push(T::decode(input)?);
        }
        Ok(items.into())
    }
}

impl<Len, T> Encode for VecOf<Len, T>
where
    Len: Encode + TryFrom<usize>,
    T: Encode,
{
    fn encode_to<O: Output + ?Sized>(&self, dest: &mut O) {
        let Ok(len) = Len::try_from(self.items.len()) else {
            return;
        };
        len.encode_to(dest);
        for item in &self.items {
            item.encode_to(dest);
        }
    }
}
