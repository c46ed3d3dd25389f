//! Catalogue of base scalar types and user-defined compound datatypes.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::validate_name;

/// High bit of a type identifier marks a compound type; the low 31
/// bits are then an index into the registry's CDT table.
const CUSTOM_BIT: u32 = 0x8000_0000;

/// A 32-bit type identifier.
///
/// Base types put their element width in the low nibble as a log2 bit
/// count (`bits = 1 << (code & 0x0F)`) and the flavour in the next
/// nibble. Compound types carry [`CUSTOM_BIT`] plus their table index.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct TagType(u32);

impl TagType {
    pub const BOOL: TagType = TagType(BaseType::Bool as u32);
    pub const BYTE: TagType = TagType(BaseType::Byte as u32);
    pub const SINT: TagType = TagType(BaseType::Sint as u32);
    pub const WORD: TagType = TagType(BaseType::Word as u32);
    pub const INT: TagType = TagType(BaseType::Int as u32);
    pub const UINT: TagType = TagType(BaseType::Uint as u32);
    pub const DWORD: TagType = TagType(BaseType::Dword as u32);
    pub const DINT: TagType = TagType(BaseType::Dint as u32);
    pub const UDINT: TagType = TagType(BaseType::Udint as u32);
    pub const TIME: TagType = TagType(BaseType::Time as u32);
    pub const REAL: TagType = TagType(BaseType::Real as u32);
    pub const LWORD: TagType = TagType(BaseType::Lword as u32);
    pub const LINT: TagType = TagType(BaseType::Lint as u32);
    pub const ULINT: TagType = TagType(BaseType::Ulint as u32);
    pub const LREAL: TagType = TagType(BaseType::Lreal as u32);

    /// Wraps a raw identifier without validating it; the registry
    /// checks identifiers wherever one crosses into the store.
    pub fn from_raw(raw: u32) -> TagType {
        TagType(raw)
    }

    pub fn into_raw(self) -> u32 {
        self.0
    }

    pub fn is_custom(self) -> bool {
        self.0 & CUSTOM_BIT != 0
    }

    /// Table index of a compound type, `None` for base identifiers.
    pub fn cdt_index(self) -> Option<usize> {
        self.is_custom().then_some((self.0 & !CUSTOM_BIT) as usize)
    }

    pub(crate) fn from_cdt_index(index: usize) -> TagType {
        TagType(index as u32 | CUSTOM_BIT)
    }

    /// The base type this identifier names, `None` for compound or
    /// unassigned codes.
    pub fn base(self) -> Option<BaseType> {
        BaseType::try_from_primitive(self.0).ok()
    }
}

impl From<BaseType> for TagType {
    fn from(base: BaseType) -> TagType {
        TagType(base.into())
    }
}

/// The fixed scalar types every deployment shares.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    TryFromPrimitive,
    IntoPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u32)]
pub enum BaseType {
    Bool = 0x0010,
    Byte = 0x0003,
    Sint = 0x0013,
    Word = 0x0004,
    Int = 0x0014,
    Uint = 0x0024,
    Dword = 0x0005,
    Dint = 0x0015,
    Udint = 0x0025,
    Time = 0x0035,
    Real = 0x0045,
    Lword = 0x0006,
    Lint = 0x0016,
    Ulint = 0x0026,
    Lreal = 0x0036,
}

impl BaseType {
    pub const ALL: [BaseType; 15] = [
        BaseType::Bool,
        BaseType::Byte,
        BaseType::Sint,
        BaseType::Word,
        BaseType::Int,
        BaseType::Uint,
        BaseType::Dword,
        BaseType::Dint,
        BaseType::Udint,
        BaseType::Time,
        BaseType::Real,
        BaseType::Lword,
        BaseType::Lint,
        BaseType::Ulint,
        BaseType::Lreal,
    ];

    /// Element width in bits.
    pub fn bits(self) -> u32 {
        1 << (u32::from(self) & 0x0f)
    }

    /// Element size in bytes. BOOL is sub-byte and reports 0; tag and
    /// layout code accounts for it bit by bit.
    pub fn size(self) -> usize {
        (self.bits() / 8) as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            BaseType::Bool => "BOOL",
            BaseType::Byte => "BYTE",
            BaseType::Sint => "SINT",
            BaseType::Word => "WORD",
            BaseType::Int => "INT",
            BaseType::Uint => "UINT",
            BaseType::Dword => "DWORD",
            BaseType::Dint => "DINT",
            BaseType::Udint => "UDINT",
            BaseType::Time => "TIME",
            BaseType::Real => "REAL",
            BaseType::Lword => "LWORD",
            BaseType::Lint => "LINT",
            BaseType::Ulint => "ULINT",
            BaseType::Lreal => "LREAL",
        }
    }

    /// Case-insensitive base-type name lookup.
    pub fn from_name(name: &str) -> Option<BaseType> {
        BaseType::ALL
            .into_iter()
            .find(|base| base.name().eq_ignore_ascii_case(name))
    }

    pub fn is_float(self) -> bool {
        matches!(self, BaseType::Real | BaseType::Lreal)
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, BaseType::Bool | BaseType::Real | BaseType::Lreal)
    }

    /// Integer or float, the types the deadband and ordering
    /// predicates accept.
    pub fn is_numeric(self) -> bool {
        self != BaseType::Bool
    }
}

/// One member of a compound datatype.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CdtMember {
    pub name: String,
    pub member_type: TagType,
    pub count: u32,
}

/// A registered compound datatype. Name, members, and table index are
/// immutable once the type is created; only the refcount moves.
#[derive(Clone, Debug)]
pub struct Cdt {
    name: String,
    members: Vec<CdtMember>,
    refcount: u32,
}

impl Cdt {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[CdtMember] {
        &self.members
    }
}

/// The shared catalogue of datatypes.
///
/// Base types are built in; compound types are appended by
/// [`TypeRegistry::create_cdt`] and never removed or reordered, so a
/// `TagType` stays valid for the life of the server.
#[derive(Debug)]
pub struct TypeRegistry {
    cdts: Vec<Cdt>,
}

impl TypeRegistry {
    /// Definition of the compound type every server carries from
    /// startup.
    const SYSTEM_CDT: &'static str = "System:StartTime,TIME,1:ModuleCount,INT,1";

    pub fn new() -> TypeRegistry {
        let mut registry = TypeRegistry { cdts: Vec::new() };
        registry
            .create_cdt(Self::SYSTEM_CDT)
            .expect("builtin datatype definition is well formed");
        registry
    }

    pub fn cdt_count(&self) -> usize {
        self.cdts.len()
    }

    /// Checks that an identifier names a base type or a registered
    /// compound type.
    pub fn check(&self, tag_type: TagType) -> Result<()> {
        let known = match tag_type.cdt_index() {
            Some(index) => index < self.cdts.len(),
            None => tag_type.base().is_some(),
        };
        if known {
            Ok(())
        } else {
            Err(Error::BadType(tag_type.into_raw()))
        }
    }

    /// Resolves a type name, base names first, then the CDT table.
    /// Both namespaces are case-insensitive.
    pub fn resolve_name(&self, name: &str) -> Option<TagType> {
        if let Some(base) = BaseType::from_name(name) {
            return Some(base.into());
        }
        self.cdts
            .iter()
            .position(|cdt| cdt.name.eq_ignore_ascii_case(name))
            .map(TagType::from_cdt_index)
    }

    pub fn name_of(&self, tag_type: TagType) -> Option<&str> {
        match tag_type.cdt_index() {
            Some(index) => self.cdts.get(index).map(|cdt| cdt.name.as_str()),
            None => tag_type.base().map(BaseType::name),
        }
    }

    pub fn cdt(&self, tag_type: TagType) -> Result<&Cdt> {
        tag_type
            .cdt_index()
            .and_then(|index| self.cdts.get(index))
            .ok_or(Error::BadType(tag_type.into_raw()))
    }

    pub fn members_of(&self, tag_type: TagType) -> Result<&[CdtMember]> {
        Ok(self.cdt(tag_type)?.members())
    }

    /// Element size in bytes. Base types report their width over 8
    /// (BOOL reports 0, the tag store sizes BOOL arrays bit by bit).
    /// Compound types are laid out with a bit cursor: BOOL members
    /// pack consecutively, any other member first aligns the cursor up
    /// to a byte boundary, and the total is rounded up to whole bytes.
    pub fn type_size(&self, tag_type: TagType) -> Result<usize> {
        self.check(tag_type)?;
        match tag_type.cdt_index() {
            None => Ok(tag_type.base().map(BaseType::size).unwrap_or(0)),
            Some(index) => {
                let mut bits = 0usize;
                for member in &self.cdts[index].members {
                    if member.member_type == TagType::BOOL {
                        bits += member.count as usize;
                        continue;
                    }
                    if bits % 8 != 0 {
                        bits = (bits | 0x07) + 1;
                    }
                    // nested CDTs contribute their full byte size
                    let unit = self.type_size(member.member_type)?;
                    bits += unit * member.count as usize * 8;
                }
                Ok(bits.div_ceil(8))
            }
        }
    }

    /// Registers a compound type from its definition string,
    /// `Name:member1,type1,count1:member2,type2,count2`. Members keep
    /// the order they are listed in.
    pub fn create_cdt(&mut self, definition: &str) -> Result<TagType> {
        let mut segments = definition.split(':');
        let name = segments.next().unwrap_or("");
        validate_name(name)?;
        if self.resolve_name(name).is_some() {
            log::error!("datatype name {name:?} is already in use");
            return Err(Error::Duplicate(name.to_string()));
        }

        let mut members: Vec<CdtMember> = Vec::new();
        for segment in segments {
            let member = self.parse_member(segment, &members)?;
            members.push(member);
        }

        let index = self.cdts.len();
        self.cdts.push(Cdt {
            name: name.to_string(),
            members,
            refcount: 0,
        });
        log::debug!("created datatype {name} at index {index}");
        Ok(TagType::from_cdt_index(index))
    }

    fn parse_member(
        &self,
        segment: &str,
        members: &[CdtMember],
    ) -> Result<CdtMember> {
        let mut fields = segment.split(',');
        let (Some(name), Some(type_name), Some(count), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            log::error!("malformed datatype member {segment:?}");
            return Err(Error::Arg("datatype member needs name,type,count"));
        };
        validate_name(name)?;
        let count: u32 = count
            .parse()
            .map_err(|_| Error::Arg("datatype member count is not a number"))?;
        if count == 0 {
            return Err(Error::Arg("datatype member count must be at least 1"));
        }
        if members
            .iter()
            .any(|member| member.name.eq_ignore_ascii_case(name))
        {
            log::error!("duplicate member name {name:?}");
            return Err(Error::Duplicate(name.to_string()));
        }
        let member_type = self
            .resolve_name(type_name)
            .ok_or_else(|| Error::NotFound(format!("member type {type_name:?}")))?;
        Ok(CdtMember {
            name: name.to_string(),
            member_type,
            count,
        })
    }

    /// Re-serialises a compound type to the definition-string form,
    /// the format clients use to mirror the registry.
    pub fn definition_of(&self, tag_type: TagType) -> Result<String> {
        let cdt = self.cdt(tag_type)?;
        let mut out = cdt.name.clone();
        for member in &cdt.members {
            let type_name = self
                .name_of(member.member_type)
                .ok_or(Error::BadType(member.member_type.into_raw()))?;
            out.push(':');
            out.push_str(&member.name);
            out.push(',');
            out.push_str(type_name);
            out.push(',');
            out.push_str(&member.count.to_string());
        }
        Ok(out)
    }

    pub fn refcount_of(&self, tag_type: TagType) -> Result<u32> {
        Ok(self.cdt(tag_type)?.refcount)
    }

    /// Bumps the number of tags backed by this compound type. A CDT
    /// with a live reference is pinned; a future tag delete calls
    /// [`TypeRegistry::dec_refcount`] to release it.
    pub fn inc_refcount(&mut self, tag_type: TagType) {
        if let Some(cdt) =
            tag_type.cdt_index().and_then(|index| self.cdts.get_mut(index))
        {
            cdt.refcount += 1;
        }
    }

    pub fn dec_refcount(&mut self, tag_type: TagType) {
        if let Some(cdt) =
            tag_type.cdt_index().and_then(|index| self.cdts.get_mut(index))
        {
            cdt.refcount = cdt.refcount.saturating_sub(1);
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> TypeRegistry {
        TypeRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(BaseType::Bool, 1, 0)]
    #[case(BaseType::Byte, 8, 1)]
    #[case(BaseType::Sint, 8, 1)]
    #[case(BaseType::Word, 16, 2)]
    #[case(BaseType::Int, 16, 2)]
    #[case(BaseType::Uint, 16, 2)]
    #[case(BaseType::Dword, 32, 4)]
    #[case(BaseType::Dint, 32, 4)]
    #[case(BaseType::Udint, 32, 4)]
    #[case(BaseType::Time, 32, 4)]
    #[case(BaseType::Real, 32, 4)]
    #[case(BaseType::Lword, 64, 8)]
    #[case(BaseType::Lint, 64, 8)]
    #[case(BaseType::Ulint, 64, 8)]
    #[case(BaseType::Lreal, 64, 8)]
    fn base_type_widths(
        #[case] base: BaseType,
        #[case] bits: u32,
        #[case] bytes: usize,
    ) {
        assert_eq!(base.bits(), bits);
        assert_eq!(base.size(), bytes);
    }

    #[test]
    fn base_names_resolve_case_insensitively() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.resolve_name("INT"), Some(TagType::INT));
        assert_eq!(registry.resolve_name("int"), Some(TagType::INT));
        assert_eq!(registry.resolve_name("lReAl"), Some(TagType::LREAL));
        assert_eq!(registry.resolve_name("FLOAT"), None);
    }

    #[test]
    fn system_type_is_seeded() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.cdt_count(), 1);
        let system = registry.resolve_name("System").unwrap();
        assert!(system.is_custom());
        // TIME aligns to a byte boundary and INT follows it
        assert_eq!(registry.type_size(system).unwrap(), 6);
        assert_eq!(
            registry.definition_of(system).unwrap(),
            "System:StartTime,TIME,1:ModuleCount,INT,1"
        );
        let members = registry.members_of(system).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "StartTime");
        assert_eq!(members[1].member_type, TagType::INT);
    }

    #[test]
    fn refcounts_move_with_tag_usage() {
        let mut registry = TypeRegistry::new();
        let point = registry.create_cdt("Point:x,REAL,1:y,REAL,1").unwrap();
        assert_eq!(registry.refcount_of(point).unwrap(), 0);
        registry.inc_refcount(point);
        registry.inc_refcount(point);
        registry.dec_refcount(point);
        assert_eq!(registry.refcount_of(point).unwrap(), 1);
        // release below zero is clamped
        registry.dec_refcount(point);
        registry.dec_refcount(point);
        assert_eq!(registry.refcount_of(point).unwrap(), 0);
    }

    #[test]
    fn bool_members_pack_bitwise() {
        let mut registry = TypeRegistry::new();
        let flags = registry
            .create_cdt("Flags:a,BOOL,3:b,BOOL,5:c,BOOL,1")
            .unwrap();
        assert_eq!(registry.type_size(flags).unwrap(), 2);
    }

    #[test]
    fn non_bool_members_align_to_byte() {
        let mut registry = TypeRegistry::new();
        let mixed = registry.create_cdt("Mixed:flag,BOOL,1:value,INT,1").unwrap();
        assert_eq!(registry.type_size(mixed).unwrap(), 3);
    }

    #[test]
    fn nested_cdt_contributes_its_byte_size() {
        let mut registry = TypeRegistry::new();
        registry.create_cdt("Inner:bits,BOOL,3").unwrap();
        let outer = registry
            .create_cdt("Outer:lead,BOOL,1:pair,Inner,2:tail,SINT,1")
            .unwrap();
        // 1 bit, align, 2 x 1 byte, 1 byte
        assert_eq!(registry.type_size(outer).unwrap(), 4);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = TypeRegistry::new();
        registry.create_cdt("Point:x,REAL,1:y,REAL,1").unwrap();
        assert_eq!(
            registry.create_cdt("point:z,REAL,1"),
            Err(Error::Duplicate("point".to_string()))
        );
        assert_eq!(
            registry.create_cdt("INT:v,DINT,1"),
            Err(Error::Duplicate("INT".to_string()))
        );
        assert_eq!(
            registry.create_cdt("Twice:a,INT,1:A,INT,1"),
            Err(Error::Duplicate("A".to_string()))
        );
    }

    #[test]
    fn malformed_members_are_rejected() {
        let mut registry = TypeRegistry::new();
        assert!(matches!(
            registry.create_cdt("Bad:member,INT"),
            Err(Error::Arg(_))
        ));
        assert!(matches!(
            registry.create_cdt("Bad:member,INT,0"),
            Err(Error::Arg(_))
        ));
        assert!(matches!(
            registry.create_cdt("Bad:member,NOPE,1"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            registry.create_cdt("9bad:member,INT,1"),
            Err(Error::Arg(_))
        ));
    }

    #[test]
    fn unknown_identifiers_fail_check() {
        let registry = TypeRegistry::new();
        assert!(registry.check(TagType::from_raw(0x0099)).is_err());
        assert!(registry.check(TagType::from_cdt_index(40)).is_err());
        assert!(registry.check(TagType::from_cdt_index(0)).is_ok());
    }
}
