//! Fixed defect taxonomy shared by training, export and inference.
//!
//! The numeric id of each class is stable and matches the label order the
//! mobile app expects.

use std::fmt;

pub const NUM_CLASSES: usize = 12;

pub const CLASS_NAMES: [&str; NUM_CLASSES] = [
    "agujero_ok",
    "agujero_defectuoso",
    "avellanado_ok",
    "avellanado_defectuoso",
    "sin_rayadura",
    "rayadura_leve",
    "rayadura_severa",
    "sin_deformacion",
    "deformado",
    "alodine_ok",
    "alodine_ausente",
    "alodine_irregular",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefectClass {
    HoleOk,
    HoleDefective,
    CountersinkOk,
    CountersinkDefective,
    ScratchNone,
    ScratchMinor,
    ScratchSevere,
    DeformationOk,
    DeformationPresent,
    AlodineOk,
    AlodineAbsent,
    AlodineIrregular,
}

impl DefectClass {
    pub const ALL: [DefectClass; NUM_CLASSES] = [
        DefectClass::HoleOk,
        DefectClass::HoleDefective,
        DefectClass::CountersinkOk,
        DefectClass::CountersinkDefective,
        DefectClass::ScratchNone,
        DefectClass::ScratchMinor,
        DefectClass::ScratchSevere,
        DefectClass::DeformationOk,
        DefectClass::DeformationPresent,
        DefectClass::AlodineOk,
        DefectClass::AlodineAbsent,
        DefectClass::AlodineIrregular,
    ];

    pub fn id(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        CLASS_NAMES[self.id()]
    }

    pub fn from_id(id: usize) -> Option<Self> {
        Self::ALL.get(id).copied()
    }

    pub fn from_label(label: &str) -> Option<Self> {
        CLASS_NAMES
            .iter()
            .position(|&name| name == label)
            .and_then(Self::from_id)
    }

    /// Inspection attribute this class belongs to.
    pub fn kind(self) -> InspectionKind {
        match self {
            DefectClass::HoleOk | DefectClass::HoleDefective => InspectionKind::Hole,
            DefectClass::CountersinkOk | DefectClass::CountersinkDefective => {
                InspectionKind::Countersink
            }
            DefectClass::ScratchNone | DefectClass::ScratchMinor | DefectClass::ScratchSevere => {
                InspectionKind::Scratch
            }
            DefectClass::DeformationOk | DefectClass::DeformationPresent => {
                InspectionKind::Deformation
            }
            DefectClass::AlodineOk | DefectClass::AlodineAbsent | DefectClass::AlodineIrregular => {
                InspectionKind::Alodine
            }
        }
    }
}

impl fmt::Display for DefectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The kind of region a detector handed to the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InspectionKind {
    Hole,
    Countersink,
    Scratch,
    Deformation,
    Alodine,
}

impl InspectionKind {
    pub fn classes(self) -> &'static [DefectClass] {
        let all = &DefectClass::ALL;
        match self {
            InspectionKind::Hole => &all[0..2],
            InspectionKind::Countersink => &all[2..4],
            InspectionKind::Scratch => &all[4..7],
            InspectionKind::Deformation => &all[7..9],
            InspectionKind::Alodine => &all[9..12],
        }
    }

    /// Class reported when the prediction falls outside this kind.
    pub fn ok_class(self) -> DefectClass {
        self.classes()[0]
    }

    pub fn restrict(self, predicted: DefectClass) -> DefectClass {
        if predicted.kind() == self {
            predicted
        } else {
            self.ok_class()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn taxonomy_has_twelve_unique_labels() {
        assert_eq!(CLASS_NAMES.len(), 12);
        let unique: HashSet<_> = CLASS_NAMES.iter().collect();
        assert_eq!(unique.len(), CLASS_NAMES.len());
    }

    #[test]
    fn ids_follow_label_order() {
        for (i, class) in DefectClass::ALL.iter().enumerate() {
            assert_eq!(class.id(), i);
            assert_eq!(DefectClass::from_label(class.label()), Some(*class));
        }
        assert_eq!(DefectClass::from_id(12), None);
        assert_eq!(DefectClass::from_label("unknown"), None);
    }

    #[test]
    fn every_class_belongs_to_exactly_one_kind() {
        let kinds = [
            InspectionKind::Hole,
            InspectionKind::Countersink,
            InspectionKind::Scratch,
            InspectionKind::Deformation,
            InspectionKind::Alodine,
        ];
        let total: usize = kinds.iter().map(|k| k.classes().len()).sum();
        assert_eq!(total, NUM_CLASSES);
        for kind in kinds {
            for class in kind.classes() {
                assert_eq!(class.kind(), kind);
            }
        }
    }

    #[test]
    fn restrict_falls_back_to_ok_class() {
        assert_eq!(
            InspectionKind::Scratch.restrict(DefectClass::ScratchSevere),
            DefectClass::ScratchSevere
        );
        assert_eq!(
            InspectionKind::Scratch.restrict(DefectClass::HoleDefective),
            DefectClass::ScratchNone
        );
        assert_eq!(
            InspectionKind::Alodine.restrict(DefectClass::DeformationPresent),
            DefectClass::AlodineOk
        );
    }
}
