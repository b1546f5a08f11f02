//! Parasitic resistances and capacitances of a vertical NAND string cell, derived from the
//! geometry and material description and written in the form NVSim reads.
use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::{
    error::ParamError,
    expr::{Env, Value},
    ini::Ini,
};

/// Vacuum permittivity in F/m, visible to `[material]` expressions.
pub const PERMITTIVITY: f64 = 8.85e-12;

/// `(section, name)` in evaluation order. An expression may refer to any name defined above it.
const INPUTS: &[(&str, &str)] = &[
    ("temperature", "TEMP"),
    ("staircase", "STAIR_LENGTH"),
    ("staircase", "NUM_STAIRS"),
    ("staircase", "TRENCH_WIDTH"),
    ("wordline", "Barrier_width"),
    ("wordline", "L_g"),
    ("wordline", "L_g_tr"),
    ("wordline", "L_spacer"),
    ("channel", "r_f"),
    ("channel", "t_si"),
    ("channel", "r"),
    ("channel", "t_1"),
    ("channel", "t_2"),
    ("channel", "t_3"),
    ("channel", "t_4"),
    ("channel", "t_ox"),
    ("channel", "W_f"),
    ("channel", "H_f"),
    ("channel", "W_g"),
    ("channel", "H_g"),
    ("material", "epsilon_sio"),
    ("material", "epsilon_si"),
    ("material", "epsilon_sion"),
    ("material", "epsilon_sin"),
    ("material", "epsilon_alo"),
    ("material", "Tungsten_Resistivity"),
    ("material", "Polysi_Resistivity"),
];

/// Derived quantities in evaluation order. They go through the same evaluator as the inputs,
/// so operand order and int/float promotion follow Python arithmetic exactly.
const FORMULAS: &[(&str, &str)] = &[
    ("HfWf", "math.sqrt(pow(W_f, 2) + pow(H_f, 2))"),
    // fringe between gate and source/drain, wide and narrow spacer cases
    ("C_of_gsd1", "0."),
    (
        "C_of_gsd2",
        "epsilon_sio * (4. * W_f * H_f - math.pi * pow(r + t_ox, 2)) / L_spacer",
    ),
    (
        "nu",
        "epsilon_sio * math.sqrt(2 * math.pi * r * (HfWf - r - t_ox) \
         / (4 * H_f * W_f - math.pi * pow((r + t_ox), 2)))",
    ),
    (
        "C_of_gex1",
        "8 / math.pi * nu * ((H_f - r - t_ox) * (2 * W_f / H_f + 1 - H_f / HfWf) \
         + (W_f - r - t_ox) * (2 * H_f / W_f + 1 - W_f / HfWf))",
    ),
    (
        "C_of_gex2",
        "4 * epsilon_sio * (L_spacer - t_ox + r * math.log(L_spacer / t_ox)) \
         * math.sqrt(2 * r / (L_spacer + 2 * r + t_ox))",
    ),
    ("C_of_gsd_plain", "epsilon_sio * 2 * H_f / L_spacer"),
    (
        "C_if",
        "4. * epsilon_si * (r + t_ox) * math.log((2 * t_ox + r) / (2 * t_ox))",
    ),
    // gate stack as four coaxial layers in series
    ("C_gc1", "2. * math.pi * epsilon_sion * L_g / math.log((r + t_1) / r)"),
    (
        "C_gc2",
        "2. * math.pi * epsilon_sin * L_g / math.log((r + t_1 + t_2) / (r + t_1))",
    ),
    (
        "C_gc3",
        "2. * math.pi * epsilon_sio * L_g / math.log((r + t_1 + t_2 + t_3) / (r + t_1 + t_2))",
    ),
    (
        "C_gc4",
        "2. * math.pi * epsilon_alo * L_g \
         / math.log((r + t_1 + t_2 + t_3 + t_4) / (r + t_1 + t_2 + t_3))",
    ),
    (
        "C_gc",
        "1. / (1. / C_gc1 + 1. / C_gc2 + 1. / C_gc3 + 1. / C_gc4)",
    ),
    (
        "wl_unit_cell_resistance",
        "Tungsten_Resistivity / (L_g * 2 * H_f) * W_g * 2 + Tungsten_Resistivity / L_g * 3.0 * 2",
    ),
    (
        "wl_staircase_resistance",
        "Tungsten_Resistivity / (L_g * 2 * H_f)",
    ),
    (
        "contact_unit_cell_resistance",
        "Tungsten_Resistivity / ((r * r) * math.pi)",
    ),
    (
        "string_unit_cell_resistance",
        "Polysi_Resistivity / ((r * r - r_f * r_f) * math.pi)",
    ),
    (
        "cap_per_cell_capacitance",
        "epsilon_sio * math.pi / math.log(W_f * 2 / (r_f + t_si)) * L_spacer",
    ),
    ("CellLength", "H_f * 2"),
    ("CellWidth", "W_f * 2"),
    ("CellHeight", "L_spacer + L_g + Barrier_width * 2"),
];

#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Entry(&'static str, Value),
    Blank,
}

/// One NVSim configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    pub name: &'static str,
    pub lines: Vec<Line>,
}

impl ConfigFile {
    pub fn value(&self, key: &str) -> Option<Value> {
        self.lines.iter().find_map(|l| match l {
            Line::Entry(k, v) if *k == key => Some(*v),
            _ => None,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry(key, value) => {
                    let _ = writeln!(out, "-{}: {}", key, value);
                }
                Line::Blank => out.push('\n'),
            }
        }
        out
    }
}

/// Every input and derived quantity of one cell.
#[derive(Debug, Clone)]
pub struct NandCell {
    env: Env,
}

impl NandCell {
    pub fn from_ini(ini: &Ini) -> Result<Self, ParamError> {
        let mut env = Env::new();
        for (section, name) in INPUTS {
            if *section == "material" && env.get("permittivity").is_err() {
                env.set("permittivity", Value::Float(PERMITTIVITY));
            }
            let source = ini.get(section, name)?;
            let value = env.eval(source).map_err(|e| ParamError::Eval {
                key: format!("[{}] {}", section, name),
                source: Box::new(e),
            })?;
            debug!("{} = {}", name, value);
            env.set(*name, value);
        }
        for (name, source) in FORMULAS {
            let value = env.eval(source).map_err(|e| ParamError::Eval {
                key: name.to_string(),
                source: Box::new(e),
            })?;
            env.set(*name, value);
        }
        // a spacer at least as long as the fin diagonal sees no gate/source-drain fringe
        let wide_spacer = env.get("L_spacer")?.as_f64() >= env.get("HfWf")?.as_f64();
        let (gsd, gex) = if wide_spacer {
            ("C_of_gsd1", "C_of_gex1")
        } else {
            ("C_of_gsd2", "C_of_gex2")
        };
        env.set("C_of_gsd", env.get(gsd)?);
        env.set("C_of_gex", env.get(gex)?);
        Ok(Self { env })
    }

    pub fn load(path: &Path) -> Result<Self, ParamError> {
        Self::from_ini(&Ini::load(path)?)
    }

    pub fn get(&self, name: &str) -> Result<Value, ParamError> {
        self.env.get(name)
    }

    pub fn config_files(&self) -> Result<Vec<ConfigFile>, ParamError> {
        let entries = |name: &'static str, keys: &[(&'static str, &str)]| {
            keys.iter()
                .map(|(key, var)| Ok(Line::Entry(*key, self.get(var)?)))
                .collect::<Result<Vec<_>, ParamError>>()
                .map(|lines| ConfigFile { name, lines })
        };
        let mut parasitic = entries("parasitic.cfg", &[
            ("flCapGc", "C_gc"),
            ("flCapOfGex", "C_of_gex"),
            ("flCapOfGsd", "C_of_gsd"),
        ])?;
        parasitic.lines.push(Line::Blank);
        // the trap layer shares the gate length of the floating layer
        parasitic.lines.extend(
            entries("parasitic.cfg", &[
                ("trCapGc", "C_gc"),
                ("trCapOfGex", "C_of_gex1"),
                ("trCapIf", "C_if"),
                ("trCapOfGsd", "C_of_gsd"),
            ])?
            .lines,
        );
        parasitic.lines.push(Line::Blank);
        parasitic
            .lines
            .push(Line::Entry("plCapOfGsd", self.get("C_of_gsd_plain")?));

        Ok(vec![
            entries("stringWire.cfg", &[
                ("resWirePerUnit", "string_unit_cell_resistance"),
                ("capWirePerUnit", "cap_per_cell_capacitance"),
            ])?,
            entries("contactWire.cfg", &[(
                "resWirePerUnit",
                "contact_unit_cell_resistance",
            )])?,
            entries("wordlineWire.cfg", &[
                ("resWirePerCell", "wl_unit_cell_resistance"),
                ("resWirePerStaircase", "wl_staircase_resistance"),
            ])?,
            entries("selectlineWire.cfg", &[(
                "resWirePerCell",
                "wl_unit_cell_resistance",
            )])?,
            parasitic,
            entries("cellDimension.cfg", &[
                ("CellLength (m)", "CellLength"),
                ("CellWidth (m)", "CellWidth"),
                ("CellHeight (m)", "CellHeight"),
                ("NumStairs", "NUM_STAIRS"),
                ("StairLength", "STAIR_LENGTH"),
                ("TrenchWidth", "TRENCH_WIDTH"),
                ("Temperature (K)", "TEMP"),
            ])?,
        ])
    }

    /// Writes every configuration file into `out_dir`, creating it if needed.
    pub fn write_all(&self, out_dir: &Path) -> Result<Vec<PathBuf>, ParamError> {
        fs::create_dir_all(out_dir)?;
        let mut written = Vec::new();
        for file in self.config_files()? {
            let path = out_dir.join(file.name);
            fs::write(&path, file.render())?;
            info!("wrote {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}
