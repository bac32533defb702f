//! Low-level AcroForm traversal shared by the extractor, the fill engine
//! and the flatten engine.

use std::collections::BTreeMap;

use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::error::ProcessingError;
use crate::types::{FieldKind, FieldRect};

/// Field-flag bit marking a field as required (PDF 32000-1, table 221).
const FF_REQUIRED: i64 = 1 << 1;

/// A terminal form field with its widget geometry and current value.
#[derive(Debug, Clone)]
pub struct AcroField {
    pub id: ObjectId,
    pub name: String,
    pub kind: FieldKind,
    pub rect: Option<FieldRect>,
    pub page_index: Option<u32>,
    pub required: bool,
    pub value: Option<String>,
}

/// Follows reference chains to the underlying object.
pub fn resolve<'a>(doc: &'a Document, mut obj: &'a Object) -> Result<&'a Object, lopdf::Error> {
    // Reference-to-reference chains are rare but legal; bound the walk so
    // a cycle cannot spin. A leftover reference fails downstream typing.
    let mut hops = 0;
    while let Object::Reference(id) = obj {
        obj = doc.get_object(*id)?;
        hops += 1;
        if hops > 8 {
            break;
        }
    }
    Ok(obj)
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Result<&'a Dictionary, lopdf::Error> {
    resolve(doc, obj)?.as_dict()
}

/// Returns the AcroForm dictionary, if the document has one.
pub fn acroform_dict(doc: &Document) -> Result<Option<&Dictionary>, ProcessingError> {
    let catalog = doc.catalog().map_err(ProcessingError::from)?;
    match catalog.get(b"AcroForm") {
        Ok(obj) => Ok(Some(resolve_dict(doc, obj).map_err(ProcessingError::from)?)),
        Err(_) => Ok(None),
    }
}

/// Object id of the AcroForm dictionary when it is held indirectly.
pub fn acroform_ref(doc: &Document) -> Option<ObjectId> {
    let catalog = doc.catalog().ok()?;
    match catalog.get(b"AcroForm") {
        Ok(Object::Reference(id)) => Some(*id),
        _ => None,
    }
}

/// Collects all terminal form fields in document order. A document without
/// an AcroForm dictionary yields an empty list — a plain, non-fillable PDF
/// is a valid input, not an error.
pub fn collect_fields(doc: &Document) -> Result<Vec<AcroField>, ProcessingError> {
    let Some(form) = acroform_dict(doc)? else {
        return Ok(Vec::new());
    };
    let Ok(fields_obj) = form.get(b"Fields") else {
        return Ok(Vec::new());
    };
    let roots = resolve(doc, fields_obj)
        .and_then(Object::as_array)
        .map_err(ProcessingError::from)?
        .clone();

    let page_of = page_index_map(doc);
    let mut out = Vec::new();
    for entry in &roots {
        if let Object::Reference(id) = entry {
            walk_field(doc, *id, None, None, 0, &page_of, &mut out)?;
        }
    }
    Ok(out)
}

fn walk_field(
    doc: &Document,
    id: ObjectId,
    inherited_name: Option<String>,
    inherited_ft: Option<Vec<u8>>,
    inherited_ff: i64,
    page_of: &BTreeMap<ObjectId, u32>,
    out: &mut Vec<AcroField>,
) -> Result<(), ProcessingError> {
    let dict = doc
        .get_object(id)
        .and_then(Object::as_dict)
        .map_err(ProcessingError::from)?;

    let partial = dict
        .get(b"T")
        .ok()
        .and_then(|o| resolve(doc, o).ok())
        .and_then(string_value);
    let name = match (&inherited_name, &partial) {
        (Some(parent), Some(part)) => Some(format!("{parent}.{part}")),
        (None, Some(part)) => Some(part.clone()),
        (Some(parent), None) => Some(parent.clone()),
        (None, None) => None,
    };

    let ft = dict
        .get(b"FT")
        .ok()
        .and_then(|o| resolve(doc, o).ok())
        .and_then(|o| o.as_name().ok().map(<[u8]>::to_vec))
        .or(inherited_ft);

    let ff = dict
        .get(b"Ff")
        .ok()
        .and_then(|o| resolve(doc, o).ok())
        .and_then(|o| o.as_i64().ok())
        .unwrap_or(inherited_ff);

    // A node whose kids carry their own partial names is an internal field
    // group; recurse. Kids without names are widget annotations of this
    // terminal field.
    if let Some(kids) = dict
        .get(b"Kids")
        .ok()
        .and_then(|o| resolve(doc, o).ok())
        .and_then(|o| o.as_array().ok())
    {
        let named_kids = kids.iter().any(|kid| {
            resolve_dict(doc, kid)
                .ok()
                .map(|d| d.has(b"T"))
                .unwrap_or(false)
        });
        if named_kids {
            for kid in kids {
                if let Object::Reference(kid_id) = kid {
                    walk_field(doc, *kid_id, name.clone(), ft.clone(), ff, page_of, out)?;
                }
            }
            return Ok(());
        }
    }

    let Some(name) = name else {
        return Ok(());
    };
    // Signature fields are not fillable by this engine.
    if matches!(ft.as_deref(), Some(b"Sig")) {
        return Ok(());
    }

    let kind = match ft.as_deref() {
        Some(b"Btn") => FieldKind::Checkbox,
        Some(b"Ch") => FieldKind::Choice,
        _ => FieldKind::Text,
    };

    let (rect, widget_id) = widget_geometry(doc, id, dict);
    let page_index = widget_page(doc, widget_id, dict, page_of);
    let value = dict
        .get(b"V")
        .ok()
        .and_then(|o| resolve(doc, o).ok())
        .and_then(string_value);

    out.push(AcroField {
        id,
        name,
        kind,
        rect,
        page_index,
        required: ff & FF_REQUIRED != 0,
        value,
    });
    Ok(())
}

/// Rect of the field's widget: the field dictionary itself when field and
/// widget are merged, otherwise the first kid widget.
fn widget_geometry(doc: &Document, id: ObjectId, dict: &Dictionary) -> (Option<FieldRect>, ObjectId) {
    if let Some(rect) = rect_of(doc, dict) {
        return (Some(rect), id);
    }
    if let Some(kids) = dict
        .get(b"Kids")
        .ok()
        .and_then(|o| resolve(doc, o).ok())
        .and_then(|o| o.as_array().ok())
    {
        for kid in kids {
            if let Object::Reference(kid_id) = kid {
                if let Ok(kid_dict) = doc.get_object(*kid_id).and_then(Object::as_dict) {
                    if let Some(rect) = rect_of(doc, kid_dict) {
                        return (Some(rect), *kid_id);
                    }
                }
            }
        }
    }
    (None, id)
}

fn widget_page(
    doc: &Document,
    widget_id: ObjectId,
    dict: &Dictionary,
    page_of: &BTreeMap<ObjectId, u32>,
) -> Option<u32> {
    if let Ok(Object::Reference(page_id)) = dict.get(b"P") {
        if let Some(index) = page_of.get(page_id) {
            return Some(*index);
        }
    }
    // No /P entry: scan each page's annotation array for the widget.
    for (page_id, index) in page_of {
        if let Ok(page) = doc.get_object(*page_id).and_then(Object::as_dict) {
            if let Some(annots) = page
                .get(b"Annots")
                .ok()
                .and_then(|o| resolve(doc, o).ok())
                .and_then(|o| o.as_array().ok())
            {
                if annots
                    .iter()
                    .any(|a| matches!(a, Object::Reference(id) if *id == widget_id))
                {
                    return Some(*index);
                }
            }
        }
    }
    None
}

fn rect_of(doc: &Document, dict: &Dictionary) -> Option<FieldRect> {
    let arr = dict
        .get(b"Rect")
        .ok()
        .and_then(|o| resolve(doc, o).ok())
        .and_then(|o| o.as_array().ok())?;
    if arr.len() != 4 {
        return None;
    }
    let mut nums = [0.0f64; 4];
    for (i, obj) in arr.iter().enumerate() {
        nums[i] = number(resolve(doc, obj).ok()?)?;
    }
    Some(FieldRect {
        x0: nums[0],
        y0: nums[1],
        x1: nums[2],
        y1: nums[3],
    })
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some(f64::from(*f)),
        _ => None,
    }
}

fn string_value(obj: &Object) -> Option<String> {
    match obj {
        Object::String(bytes, _) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Object::Name(name) => Some(String::from_utf8_lossy(name).into_owned()),
        _ => None,
    }
}

/// 0-based page index per page object id.
pub fn page_index_map(doc: &Document) -> BTreeMap<ObjectId, u32> {
    doc.get_pages()
        .into_iter()
        .map(|(no, id)| (id, no - 1))
        .collect()
}

/// Encodes text to WinAnsi bytes for literal strings and content streams.
/// The mask glyph maps to the WinAnsi bullet; anything else outside Latin-1
/// degrades to `?`.
pub fn encode_winansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c {
            '\u{2022}' => 0x95,
            c if (c as u32) < 0x100 => c as u8,
            _ => b'?',
        })
        .collect()
}
