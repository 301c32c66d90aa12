//! Pull-based extraction of `AIUTO` records from an RNA XML stream.
//!
//! [`RecordCursor`] walks the namespace-resolved event stream and hands back
//! one complete record at a time. Nothing from an earlier record is kept
//! once it has been returned, so memory stays proportional to a single
//! record no matter how large the file is.

use std::io::BufRead;
use std::mem;

use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;

use crate::error::ExtractError;
use crate::schema::{AidRow, ComponentRow, InstrumentRow};

/// Namespace of the RNA aid schema.
pub const RNA_NAMESPACE: &str = "http://www.rna.it/RNA_aiuto/schema";

const RECORD: &str = "AIUTO";
const COMPONENTS: &str = "COMPONENTI_AIUTO";
const COMPONENT: &str = "COMPONENTE_AIUTO";
const INSTRUMENTS: &str = "STRUMENTI_AIUTO";
const INSTRUMENT: &str = "STRUMENTO_AIUTO";

/// Placeholder for elements we do not care about (or foreign namespaces).
const OTHER: &str = "";

const KNOWN_TAGS: &[&str] = &[
    RECORD,
    COMPONENTS,
    COMPONENT,
    INSTRUMENTS,
    INSTRUMENT,
    "CAR",
    "TITOLO_MISURA",
    "DES_TIPO_MISURA",
    "BASE_GIURIDICA_NAZIONALE",
    "CODICE_FISCALE_BENEFICIARIO",
    "DENOMINAZIONE_BENEFICIARIO",
    "REGIONE_BENEFICIARIO",
    "TITOLO_PROGETTO",
    "COR",
    "DATA_CONCESSIONE",
    "ID_COMPONENTE_AIUTO",
    "COD_PROCEDIMENTO",
    "DES_PROCEDIMENTO",
    "COD_REGOLAMENTO",
    "DES_REGOLAMENTO",
    "COD_OBIETTIVO",
    "DES_OBIETTIVO",
    "SETTORE_ATTIVITA",
    "COD_STRUMENTO",
    "DES_STRUMENTO",
    "ELEMENTO_DI_AIUTO",
    "IMPORTO_NOMINALE",
];

fn intern(local: &[u8]) -> &'static str {
    KNOWN_TAGS
        .iter()
        .copied()
        .find(|tag| tag.as_bytes() == local)
        .unwrap_or(OTHER)
}

/// Trimmed text, `None` when nothing but whitespace is left.
fn clean_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Year from the first four characters of a grant date, `0` when unusable.
pub fn derive_year(date: Option<&str>) -> i32 {
    let Some(date) = date else { return 0 };
    match date.char_indices().nth(3) {
        Some((i, c)) => date[..i + c.len_utf8()].parse().unwrap_or(0),
        None => 0,
    }
}

/// Amount parsing: anything missing or unparsable counts as `0.0`.
pub fn parse_amount(text: Option<&str>) -> f64 {
    text.and_then(|t| t.parse::<f64>().ok()).unwrap_or(0.0)
}

// ─────────────────────────────────────────────────────────────
//  RECORD TREE
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentTree {
    pub cod_strumento: Option<String>,
    pub des_strumento: Option<String>,
    pub elemento_di_aiuto: Option<String>,
    pub importo_nominale: Option<String>,
}

impl InstrumentTree {
    fn set_field(&mut self, tag: &str, text: Option<String>) {
        let slot = match tag {
            "COD_STRUMENTO" => &mut self.cod_strumento,
            "DES_STRUMENTO" => &mut self.des_strumento,
            "ELEMENTO_DI_AIUTO" => &mut self.elemento_di_aiuto,
            "IMPORTO_NOMINALE" => &mut self.importo_nominale,
            _ => return,
        };
        if slot.is_none() {
            *slot = text;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentTree {
    pub id_componente_aiuto: Option<String>,
    pub cod_procedimento: Option<String>,
    pub des_procedimento: Option<String>,
    pub cod_regolamento: Option<String>,
    pub des_regolamento: Option<String>,
    pub cod_obiettivo: Option<String>,
    pub des_obiettivo: Option<String>,
    pub settore_attivita: Option<String>,
    pub instruments: Vec<InstrumentTree>,
}

impl ComponentTree {
    fn set_field(&mut self, tag: &str, text: Option<String>) {
        let slot = match tag {
            "ID_COMPONENTE_AIUTO" => &mut self.id_componente_aiuto,
            "COD_PROCEDIMENTO" => &mut self.cod_procedimento,
            "DES_PROCEDIMENTO" => &mut self.des_procedimento,
            "COD_REGOLAMENTO" => &mut self.cod_regolamento,
            "DES_REGOLAMENTO" => &mut self.des_regolamento,
            "COD_OBIETTIVO" => &mut self.cod_obiettivo,
            "DES_OBIETTIVO" => &mut self.des_obiettivo,
            "SETTORE_ATTIVITA" => &mut self.settore_attivita,
            _ => return,
        };
        if slot.is_none() {
            *slot = text;
        }
    }
}

/// One `AIUTO` element with its nested components and instruments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AidTree {
    pub car: Option<String>,
    pub titolo_misura: Option<String>,
    pub des_tipo_misura: Option<String>,
    pub base_giuridica_nazionale: Option<String>,
    pub codice_fiscale_beneficiario: Option<String>,
    pub denominazione_beneficiario: Option<String>,
    pub regione_beneficiario: Option<String>,
    pub titolo_progetto: Option<String>,
    pub cor: Option<String>,
    pub data_concessione: Option<String>,
    pub components: Vec<ComponentTree>,
}

/// Rows produced by flattening one [`AidTree`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordRows {
    pub aid: AidRow,
    pub components: Vec<ComponentRow>,
    pub instruments: Vec<InstrumentRow>,
}

impl AidTree {
    fn set_field(&mut self, tag: &str, text: Option<String>) {
        let slot = match tag {
            "CAR" => &mut self.car,
            "TITOLO_MISURA" => &mut self.titolo_misura,
            "DES_TIPO_MISURA" => &mut self.des_tipo_misura,
            "BASE_GIURIDICA_NAZIONALE" => &mut self.base_giuridica_nazionale,
            "CODICE_FISCALE_BENEFICIARIO" => &mut self.codice_fiscale_beneficiario,
            "DENOMINAZIONE_BENEFICIARIO" => &mut self.denominazione_beneficiario,
            "REGIONE_BENEFICIARIO" => &mut self.regione_beneficiario,
            "TITOLO_PROGETTO" => &mut self.titolo_progetto,
            "COR" => &mut self.cor,
            "DATA_CONCESSIONE" => &mut self.data_concessione,
            _ => return,
        };
        if slot.is_none() {
            *slot = text;
        }
    }

    /// Flattens the tree into entity rows. Children inherit the year and the
    /// foreign keys of their parent.
    pub fn into_rows(self, file_source: &str) -> RecordRows {
        let anno = derive_year(self.data_concessione.as_deref());
        let mut components = Vec::with_capacity(self.components.len());
        let mut instruments = Vec::new();

        for comp in self.components {
            for instr in comp.instruments {
                instruments.push(InstrumentRow {
                    id_componente_aiuto: comp.id_componente_aiuto.clone(),
                    elemento_di_aiuto: parse_amount(instr.elemento_di_aiuto.as_deref()),
                    importo_nominale: parse_amount(instr.importo_nominale.as_deref()),
                    cod_strumento: instr.cod_strumento,
                    des_strumento: instr.des_strumento,
                    anno,
                });
            }
            components.push(ComponentRow {
                id_componente_aiuto: comp.id_componente_aiuto,
                car_aiuto: self.car.clone(),
                cor_aiuto: self.cor.clone(),
                cod_procedimento: comp.cod_procedimento,
                des_procedimento: comp.des_procedimento,
                cod_regolamento: comp.cod_regolamento,
                des_regolamento: comp.des_regolamento,
                cod_obiettivo: comp.cod_obiettivo,
                des_obiettivo: comp.des_obiettivo,
                settore_attivita: comp.settore_attivita,
                anno,
            });
        }

        let aid = AidRow {
            car: self.car,
            titolo_misura: self.titolo_misura,
            des_tipo_misura: self.des_tipo_misura,
            base_giuridica_nazionale: self.base_giuridica_nazionale,
            codice_fiscale_beneficiario: self.codice_fiscale_beneficiario,
            denominazione_beneficiario: self.denominazione_beneficiario,
            regione_beneficiario: self.regione_beneficiario,
            titolo_progetto: self.titolo_progetto,
            cor: self.cor,
            data_concessione: self.data_concessione,
            anno,
            file_source: file_source.to_string(),
        };

        RecordRows {
            aid,
            components,
            instruments,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  CURSOR
// ─────────────────────────────────────────────────────────────

/// A record that could not be extracted; the cursor has already moved past it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFault {
    /// 1-based position of the record in the file.
    pub ordinal: u64,
    /// Byte offset where the record ended.
    pub position: u64,
    pub car: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CursorItem {
    Record(AidTree),
    Skipped(RecordFault),
}

/// State of the record currently being read.
#[derive(Default)]
struct RecordBuilder {
    record: AidTree,
    /// Elements open below the record element.
    path: Vec<&'static str>,
    /// Text of the innermost open element, up to its first child.
    text: String,
    /// Whether the innermost open element has had a child element yet.
    has_child: bool,
    /// Text and child flag of each enclosing element.
    outer: Vec<(String, bool)>,
    fault: Option<String>,
}

impl RecordBuilder {
    fn open(&mut self, tag: &'static str) {
        match (self.path.as_slice(), tag) {
            ([COMPONENTS], COMPONENT) => self.record.components.push(ComponentTree::default()),
            ([COMPONENTS, COMPONENT, INSTRUMENTS], INSTRUMENT) => {
                if let Some(comp) = self.record.components.last_mut() {
                    comp.instruments.push(InstrumentTree::default());
                }
            }
            _ => {}
        }
        self.path.push(tag);
        self.outer.push((mem::take(&mut self.text), true));
        self.has_child = false;
    }

    fn push_text(&mut self, text: &str) {
        if !self.has_child {
            self.text.push_str(text);
        }
    }

    fn close(&mut self) {
        let Some(tag) = self.path.pop() else { return };
        let text = clean_text(&mem::take(&mut self.text));
        (self.text, self.has_child) = self.outer.pop().unwrap_or_default();
        match self.path.as_slice() {
            [] => self.record.set_field(tag, text),
            [COMPONENTS, COMPONENT] => {
                if let Some(comp) = self.record.components.last_mut() {
                    comp.set_field(tag, text);
                }
            }
            [COMPONENTS, COMPONENT, INSTRUMENTS, INSTRUMENT] => {
                let instr = self
                    .record
                    .components
                    .last_mut()
                    .and_then(|comp| comp.instruments.last_mut());
                if let Some(instr) = instr {
                    instr.set_field(tag, text);
                }
            }
            _ => {}
        }
    }

    fn fail(&mut self, reason: String) {
        self.fault.get_or_insert(reason);
    }
}

fn resolve_reference(r: &BytesRef<'_>) -> Result<String, String> {
    if let Some(ch) = r.resolve_char_ref().map_err(|e| e.to_string())? {
        return Ok(ch.to_string());
    }
    let name = r.decode().map_err(|e| e.to_string())?;
    resolve_predefined_entity(&name)
        .map(str::to_owned)
        .ok_or_else(|| format!("unknown entity &{name};"))
}

/// Forward-only reader of `AIUTO` records in one namespace.
pub struct RecordCursor<R> {
    reader: NsReader<R>,
    namespace: Vec<u8>,
    buf: Vec<u8>,
    builder: Option<RecordBuilder>,
    ordinal: u64,
}

impl<R: BufRead> RecordCursor<R> {
    pub fn new(source: R, namespace_uri: &str) -> Self {
        Self {
            reader: NsReader::from_reader(source),
            namespace: namespace_uri.as_bytes().to_vec(),
            buf: Vec::with_capacity(8 * 1024),
            builder: None,
            ordinal: 0,
        }
    }

    /// Number of record elements seen so far, skipped ones included.
    pub fn records_seen(&self) -> u64 {
        self.ordinal
    }

    /// Advances to the next complete record.
    ///
    /// Returns `Ok(None)` at the end of the document. A record whose content
    /// cannot be decoded comes back as [`CursorItem::Skipped`]; errors are
    /// reserved for faults that leave the rest of the stream unreadable.
    pub fn next_record(&mut self) -> Result<Option<CursorItem>, ExtractError> {
        loop {
            self.buf.clear();
            let (ns, event) = match self.reader.read_resolved_event_into(&mut self.buf) {
                Ok(pair) => pair,
                Err(source) => {
                    return Err(ExtractError::Xml {
                        position: self.reader.buffer_position() as u64,
                        source,
                    })
                }
            };
            let in_ns = matches!(ns, ResolveResult::Bound(Namespace(uri)) if uri == self.namespace.as_slice());

            match event {
                Event::Start(e) => {
                    let tag = if in_ns { intern(e.local_name().as_ref()) } else { OTHER };
                    match self.builder.as_mut() {
                        Some(builder) => builder.open(tag),
                        None if tag == RECORD => {
                            self.ordinal += 1;
                            self.builder = Some(RecordBuilder::default());
                        }
                        None => {}
                    }
                }
                Event::Empty(e) => {
                    let tag = if in_ns { intern(e.local_name().as_ref()) } else { OTHER };
                    match self.builder.as_mut() {
                        Some(builder) => {
                            builder.open(tag);
                            builder.close();
                        }
                        None if tag == RECORD => {
                            self.ordinal += 1;
                            return Ok(Some(CursorItem::Record(AidTree::default())));
                        }
                        None => {}
                    }
                }
                Event::End(_) => {
                    let Some(builder) = self.builder.as_mut() else { continue };
                    if !builder.path.is_empty() {
                        builder.close();
                        continue;
                    }
                    let position = self.reader.buffer_position() as u64;
                    if let Some(done) = self.builder.take() {
                        return Ok(Some(Self::complete(done, self.ordinal, position)));
                    }
                }
                Event::Text(t) => {
                    if let Some(builder) = self.builder.as_mut() {
                        match t.decode() {
                            Ok(text) => builder.push_text(&text),
                            Err(e) => builder.fail(format!("undecodable text: {e}")),
                        }
                    }
                }
                Event::CData(c) => {
                    if let Some(builder) = self.builder.as_mut() {
                        match std::str::from_utf8(&c) {
                            Ok(text) => builder.push_text(text),
                            Err(e) => builder.fail(format!("undecodable CDATA: {e}")),
                        }
                    }
                }
                Event::GeneralRef(r) => {
                    if let Some(builder) = self.builder.as_mut() {
                        match resolve_reference(&r) {
                            Ok(text) => builder.push_text(&text),
                            Err(reason) => builder.fail(reason),
                        }
                    }
                }
                Event::Eof => {
                    return match self.builder.take() {
                        Some(_) => Err(ExtractError::Truncated {
                            ordinal: self.ordinal,
                        }),
                        None => Ok(None),
                    };
                }
                _ => {}
            }
        }
    }

    fn complete(done: RecordBuilder, ordinal: u64, position: u64) -> CursorItem {
        match done.fault {
            Some(reason) => CursorItem::Skipped(RecordFault {
                ordinal,
                position,
                car: done.record.car,
                reason,
            }),
            None => CursorItem::Record(done.record),
        }
    }
}

impl<R: BufRead> Iterator for RecordCursor<R> {
    type Item = Result<CursorItem, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
